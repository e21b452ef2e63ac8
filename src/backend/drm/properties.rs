use std::collections::HashMap;

/// A property as reported by the device: its kernel handle and current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawProperty {
    /// Kernel handle of the property, used to address it in atomic requests
    pub handle: u32,
    /// Raw value
    pub value: u64,
}

impl RawProperty {
    /// Create a new raw property
    pub fn new(handle: u32, value: u64) -> RawProperty {
        RawProperty { handle, value }
    }
}

/// A property of a hardware object, stamped with the store generation it was last written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Property {
    /// Kernel handle of the property
    pub handle: u32,
    /// Raw value
    pub value: u64,
    /// Store generation of the last write
    pub generation: u64,
}

impl Property {
    /// Interpret the value as a boolean
    pub fn as_bool(&self) -> bool {
        self.value != 0
    }

    /// Interpret the value as an object or blob id, `0` meaning none
    pub fn as_object(&self) -> Option<u32> {
        match self.value {
            0 => None,
            id => Some(id as u32),
        }
    }
}

/// Name to property mapping of one hardware object
///
/// Handles never change for the lifetime of a device, values are refreshed
/// when the object is queried again. Every refresh advances the generation, which
/// allows callers to notice stale snapshots.
#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    props: HashMap<String, Property>,
    generation: u64,
}

impl PropertyStore {
    /// Create a store from the properties reported by the device
    pub fn new(props: HashMap<String, RawProperty>) -> PropertyStore {
        let mut store = PropertyStore::default();
        store.refresh(props);
        store
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lookup a property
    pub fn get(&self, name: &str) -> Option<Property> {
        self.props.get(name).copied()
    }

    /// Lookup the handle of a property
    pub fn handle(&self, name: &str) -> Option<u32> {
        self.props.get(name).map(|prop| prop.handle)
    }

    /// Lookup the value of a property
    pub fn value(&self, name: &str) -> Option<u64> {
        self.props.get(name).map(|prop| prop.value)
    }

    /// Whether the object carries a property
    pub fn contains(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    /// Returns the first of `names` the object does not carry
    pub fn missing(&self, names: &[&'static str]) -> Option<&'static str> {
        names.iter().copied().find(|name| !self.contains(name))
    }

    /// Update a single value, returns `false` if the property is unknown
    pub fn update(&mut self, name: &str, value: u64) -> bool {
        let generation = self.generation + 1;
        match self.props.get_mut(name) {
            Some(prop) => {
                prop.value = value;
                prop.generation = generation;
                self.generation = generation;
                true
            }
            None => false,
        }
    }

    /// Replace all values with a fresh snapshot of the device
    pub fn refresh(&mut self, props: HashMap<String, RawProperty>) {
        self.generation += 1;
        let generation = self.generation;
        self.props = props
            .into_iter()
            .map(|(name, raw)| {
                (
                    name,
                    Property {
                        handle: raw.handle,
                        value: raw.value,
                        generation,
                    },
                )
            })
            .collect();
    }

    /// Iterate over all properties
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.props.iter().map(|(name, prop)| (name.as_str(), prop))
    }
}
