use std::collections::BTreeMap;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::Arc;

use tracing::{debug, error, info, info_span, instrument, warn};

use super::configs::{Attribute, DisplayConfigs};
use super::flattening::{ClientFlattening, FlatteningState};
use crate::backend::drm::compositor::{
    client_range, BlendMode, CommitMode, CompositionError, CompositionType, DisplayCompositor, Layer, LayerId, Stats,
};
use crate::backend::drm::vsync::VSyncWorker;
use crate::backend::drm::{
    BufferHandle, BufferImporter, ConnectorHandle, ConnectorKind, ErrorKind, Framebuffer, KmsDevice, OutFence,
    ResourceManager,
};
use crate::utils::{Buffer as BufferCoords, Physical, Rectangle, Transform};

/// Id of the synthetic layer carrying the client composited contents
pub const CLIENT_TARGET: LayerId = LayerId(u64::MAX);

/// Errors of the display interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DisplayError {
    /// Unknown config, or the display can not report the value
    #[error("Bad config")]
    BadConfig,
    /// The display is not usable
    #[error("Bad display")]
    BadDisplay,
    /// Unknown layer, or no layer to show
    #[error("Bad layer")]
    BadLayer,
    /// The hardware refused the request
    #[error("Bad parameter")]
    BadParameter,
    /// Buffers or pipeline resources are missing
    #[error("No resources")]
    NoResources,
    /// The request is not supported by this display
    #[error("Unsupported")]
    Unsupported,
}

impl DisplayError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DisplayError::BadConfig
            | DisplayError::BadLayer
            | DisplayError::BadParameter
            | DisplayError::Unsupported => ErrorKind::ConfigRejection,
            DisplayError::NoResources => ErrorKind::ResourceExhaustion,
            DisplayError::BadDisplay => ErrorKind::InternalFault,
        }
    }
}

/// Power states a display can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    /// Display off
    Off,
    /// Display on
    On,
    /// Low power mode
    Doze,
    /// Low power mode without updates
    DozeSuspend,
}

/// Color modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    /// Whatever the panel does
    Native,
    /// sRGB
    Srgb,
    /// Display P3
    DisplayP3,
}

/// Dataspace of the client target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataspace {
    /// No dataspace
    Unknown,
    /// Any other dataspace, by its raw value
    Other(i32),
}

/// How the display is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Built into the device
    Internal,
    /// Attached through an external port
    External,
}

/// A layer as set up by the host
#[derive(Debug)]
pub struct DisplayLayer {
    id: LayerId,
    buffer: Option<BufferHandle>,
    acquire_fence: Option<Arc<OwnedFd>>,
    framebuffer: Option<Arc<Framebuffer>>,
    import_failed: bool,
    requested: CompositionType,
    validated: CompositionType,
    src: Rectangle<f64, BufferCoords>,
    dst: Rectangle<i32, Physical>,
    blend: BlendMode,
    alpha: f32,
    z_order: u32,
    transform: Transform,
}

impl DisplayLayer {
    fn new(id: LayerId) -> DisplayLayer {
        DisplayLayer {
            id,
            buffer: None,
            acquire_fence: None,
            framebuffer: None,
            import_failed: false,
            requested: CompositionType::Device,
            validated: CompositionType::Device,
            src: Rectangle::zero(),
            dst: Rectangle::zero(),
            blend: BlendMode::default(),
            alpha: 1.0,
            z_order: 0,
            transform: Transform::Normal,
        }
    }

    /// Id of the layer
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Show `buffer`, waiting for `acquire_fence` before reading it
    pub fn set_buffer(&mut self, buffer: Option<BufferHandle>, acquire_fence: Option<OwnedFd>) {
        if self.buffer != buffer {
            self.framebuffer = None;
            self.import_failed = false;
        }
        self.buffer = buffer;
        self.acquire_fence = acquire_fence.map(Arc::new);
    }

    /// Part of the buffer to show
    pub fn set_source_crop(&mut self, src: Rectangle<f64, BufferCoords>) {
        self.src = src;
    }

    /// Where to show the layer
    pub fn set_display_frame(&mut self, dst: Rectangle<i32, Physical>) {
        self.dst = dst;
    }

    /// Position in the stack
    pub fn set_z_order(&mut self, z_order: u32) {
        self.z_order = z_order;
    }

    /// Blending with the layers below
    pub fn set_blend_mode(&mut self, blend: BlendMode) {
        self.blend = blend;
    }

    /// Plane alpha
    pub fn set_plane_alpha(&mut self, alpha: f32) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }

    /// Transformation of the buffer
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Composition the host asks for
    pub fn set_composition_type(&mut self, requested: CompositionType) {
        self.requested = requested;
    }

    /// Composition the host asked for
    pub fn requested_type(&self) -> CompositionType {
        self.requested
    }

    /// Composition decided by the last validation
    pub fn composition_type(&self) -> CompositionType {
        self.validated
    }

    fn pixops(&self) -> u64 {
        self.dst.area()
    }

    fn import(&mut self, device: &Arc<dyn KmsDevice>, importer: &dyn BufferImporter) -> Option<Arc<Framebuffer>> {
        if let Some(fb) = &self.framebuffer {
            return Some(fb.clone());
        }
        if self.import_failed {
            return None;
        }
        let handle = self.buffer?;
        let fb = match importer.import(&handle) {
            Ok(info) => Framebuffer::create(device, &info).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match fb {
            Ok(fb) => {
                let fb = Arc::new(fb);
                self.framebuffer = Some(fb.clone());
                Some(fb)
            }
            Err(err) => {
                debug!(layer = ?self.id, ?handle, %err, "Buffer can not be scanned out");
                self.import_failed = true;
                None
            }
        }
    }

    fn forget_framebuffer(&mut self) {
        self.framebuffer = None;
        self.import_failed = false;
    }

    fn to_layer(&self, id: LayerId, z_order: u32) -> Option<Layer> {
        let framebuffer = self.framebuffer.clone()?;
        Some(Layer {
            id,
            framebuffer: Some(framebuffer),
            src: self.src,
            dst: self.dst,
            blend: self.blend,
            alpha: self.alpha,
            z_order,
            transform: self.transform,
            acquire_fence: self.acquire_fence.clone(),
        })
    }
}

/// HDR support of a display
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HdrCapabilities {
    /// Supported HDR types
    pub types: Vec<i32>,
    /// Maximal luminance in nits
    pub max_luminance: f32,
    /// Maximal average luminance in nits
    pub max_average_luminance: f32,
    /// Minimal luminance in nits
    pub min_luminance: f32,
}

/// A logical display bound to one connector
///
/// Owns the host's layers, the display configs and, while a sink is connected, the
/// [`DisplayCompositor`] of its pipeline.
#[derive(Debug)]
pub struct Display {
    id: u64,
    connector: ConnectorHandle,
    manager: Arc<ResourceManager>,
    importer: Arc<dyn BufferImporter>,
    compositor: Option<DisplayCompositor>,
    configs: DisplayConfigs,
    layers: BTreeMap<LayerId, DisplayLayer>,
    next_layer: u64,
    client_layer: DisplayLayer,
    power_mode: PowerMode,
    color_mode: ColorMode,
    vsync: Option<VSyncWorker>,
    flattening: ClientFlattening,
    release_fences: Vec<(LayerId, Arc<OwnedFd>)>,
    total_stats: Stats,
    prev_stats: Stats,
    span: tracing::Span,
}

fn sorted_layers(layers: &BTreeMap<LayerId, DisplayLayer>) -> Vec<LayerId> {
    let mut order: Vec<&DisplayLayer> = layers.values().collect();
    order.sort_by_key(|layer| (layer.z_order, layer.id.0));
    order.into_iter().map(|layer| layer.id).collect()
}

/// Layers handed to the compositor: every device layer plus the client target at the
/// position of the lowest client layer.
fn frame_layers(
    layers: &BTreeMap<LayerId, DisplayLayer>,
    order: &[LayerId],
    client_layer: &DisplayLayer,
    require_client_target: bool,
) -> Result<Vec<Layer>, DisplayError> {
    let mut result = Vec::with_capacity(order.len());
    let mut client_z = None;
    for id in order {
        let Some(layer) = layers.get(id) else {
            continue;
        };
        match layer.validated {
            CompositionType::Device => {
                result.push(layer.to_layer(layer.id, layer.z_order).ok_or(DisplayError::NoResources)?);
            }
            CompositionType::Client => {
                client_z.get_or_insert(layer.z_order);
            }
        }
    }
    if let Some(z_order) = client_z {
        match client_layer.to_layer(CLIENT_TARGET, z_order) {
            Some(target) => result.push(target),
            None if require_client_target => return Err(DisplayError::NoResources),
            None => {}
        }
    }
    Ok(result)
}

impl Display {
    /// Create the display in `slot`, driving `connector`.
    ///
    /// The display stays without pipeline until [`Display::handle_hotplug`] reports a sink.
    pub fn new(
        slot: u64,
        connector: ConnectorHandle,
        manager: Arc<ResourceManager>,
        importer: Arc<dyn BufferImporter>,
        vsync: Option<VSyncWorker>,
        flattening: ClientFlattening,
    ) -> Display {
        let name = manager
            .connector_info(connector)
            .map(|info| info.name)
            .unwrap_or_default();
        Display {
            id: slot,
            connector,
            manager,
            importer,
            compositor: None,
            configs: DisplayConfigs::default(),
            layers: BTreeMap::new(),
            next_layer: 0,
            client_layer: DisplayLayer::new(CLIENT_TARGET),
            power_mode: PowerMode::Off,
            color_mode: ColorMode::Native,
            vsync,
            flattening,
            release_fences: Vec::new(),
            total_stats: Stats::default(),
            prev_stats: Stats::default(),
            span: info_span!("display", id = slot, connector = %name),
        }
    }

    /// Display id, the slot assigned by the resource manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connector of this display
    pub fn connector(&self) -> ConnectorHandle {
        self.connector
    }

    /// Whether a pipeline is currently bound
    pub fn is_connected(&self) -> bool {
        self.compositor.is_some()
    }

    /// The compositor of the bound pipeline
    pub fn compositor(&self) -> Option<&DisplayCompositor> {
        self.compositor.as_ref()
    }

    /// Statistics since the display was created
    pub fn stats(&self) -> Stats {
        self.total_stats
    }

    /// Where the display stands in the flattening cycle
    pub fn flattening_state(&self) -> FlatteningState {
        self.flattening.state()
    }

    /// Build or tear down the pipeline after the connector changed its state.
    ///
    /// On connect the configs are read again and the preferred config is activated.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn handle_hotplug(&mut self, connected: bool) -> Result<(), DisplayError> {
        if !connected {
            if self.compositor.take().is_some() {
                info!("Display disconnected");
            }
            self.manager.teardown(self.connector);
            self.configs = DisplayConfigs::default();
            self.client_layer.forget_framebuffer();
            for layer in self.layers.values_mut() {
                layer.forget_framebuffer();
            }
            return Ok(());
        }

        let info = self
            .manager
            .connector_info(self.connector)
            .ok_or(DisplayError::BadDisplay)?;
        self.configs = DisplayConfigs::from_connector(&info);
        if self.compositor.is_none() {
            let Some(pipeline) = self.manager.assemble(self.connector) else {
                error!(connector = %info.name, "Failed to build a pipeline");
                return Err(DisplayError::NoResources);
            };
            self.compositor = Some(DisplayCompositor::new(pipeline));
            info!("Display connected");
        }
        match self.configs.preferred().map(|config| config.id) {
            Some(id) => self.set_active_config(id),
            None => Ok(()),
        }
    }

    /// Add a layer
    pub fn create_layer(&mut self) -> LayerId {
        let id = LayerId(self.next_layer);
        self.next_layer += 1;
        self.layers.insert(id, DisplayLayer::new(id));
        id
    }

    /// Remove a layer
    pub fn destroy_layer(&mut self, id: LayerId) -> Result<(), DisplayError> {
        self.layers.remove(&id).map(|_| ()).ok_or(DisplayError::BadLayer)
    }

    /// Access a layer to update it
    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut DisplayLayer, DisplayError> {
        self.layers.get_mut(&id).ok_or(DisplayError::BadLayer)
    }

    /// Lookup a layer
    pub fn layer(&self, id: LayerId) -> Option<&DisplayLayer> {
        self.layers.get(&id)
    }

    /// Set the buffer holding the client composited layers
    pub fn set_client_target(
        &mut self,
        buffer: Option<BufferHandle>,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<(), DisplayError> {
        self.client_layer.set_buffer(buffer, acquire_fence);
        let Some(compositor) = self.compositor.as_ref() else {
            return Ok(());
        };
        let device = compositor.pipeline().device().device().clone();
        if let Some(fb) = self.client_layer.import(&device, &*self.importer) {
            self.client_layer.set_source_crop(Rectangle::from_size(fb.size().to_f64()));
        }
        Ok(())
    }

    /// Whether a client target of the given size and dataspace can be shown
    pub fn client_target_support(&self, width: u32, height: u32, dataspace: Dataspace) -> Result<(), DisplayError> {
        let ((min_w, min_h), (max_w, max_h)) = self
            .manager
            .resolution_limits(self.connector.device())
            .ok_or(DisplayError::BadDisplay)?;
        if width < min_w || height < min_h || width > max_w || height > max_h {
            return Err(DisplayError::Unsupported);
        }
        if dataspace != Dataspace::Unknown {
            return Err(DisplayError::Unsupported);
        }
        Ok(())
    }

    /// Decide the composition of every layer for the next frame.
    ///
    /// Returns the layers whose composition differs from what the host requested.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    #[profiling::function]
    pub fn validate_display(&mut self) -> Result<Vec<(LayerId, CompositionType)>, DisplayError> {
        let order = sorted_layers(&self.layers);
        let scale_with_gpu = self.manager.config().scale_with_gpu;

        let flatten = self.compositor.is_some() && self.flattening.process(self.layers.len() <= 1);
        let range = match self.compositor.as_ref() {
            Some(_) if flatten => {
                debug!(parent: &self.span, "Flattening frame");
                Some(0..order.len())
            }
            Some(compositor) => {
                let device = compositor.pipeline().device().device().clone();
                let mut needs_client: Vec<bool> = Vec::with_capacity(order.len());
                for id in order.iter() {
                    if let Some(layer) = self.layers.get_mut(id) {
                        needs_client.push(
                            layer.requested == CompositionType::Client
                                || layer.import(&device, &*self.importer).is_none()
                                || (scale_with_gpu && requires_scaling(layer)),
                        );
                    }
                }
                client_range(&needs_client, compositor.plane_count())
            }
            None => Some(0..order.len()),
        };

        for (index, id) in order.iter().enumerate() {
            if let Some(layer) = self.layers.get_mut(id) {
                layer.validated = match &range {
                    Some(range) if range.contains(&index) => CompositionType::Client,
                    _ => CompositionType::Device,
                };
            }
        }

        let has_device_layers = self.layers.values().any(|l| l.validated == CompositionType::Device);
        if let (Some(compositor), true) = (self.compositor.as_mut(), has_device_layers) {
            let layers = frame_layers(&self.layers, &order, &self.client_layer, false)?;
            let tested = compositor
                .plan_and_commit(layers, CommitMode::Test)
                .and_then(|outcome| match outcome.rejected.is_empty() {
                    true => Ok(()),
                    false => Err(CompositionError::Rejected(outcome.rejected)),
                });
            if let Err(err) = tested {
                debug!(%err, "Test commit failed, falling back to client composition");
                self.total_stats.failed_kms_validate += 1;
                for layer in self.layers.values_mut() {
                    layer.validated = CompositionType::Client;
                }
            }
        }

        for layer in self.layers.values() {
            self.total_stats.total_pixops += layer.pixops();
            if layer.validated == CompositionType::Client {
                self.total_stats.gpu_pixops += layer.pixops();
            }
        }
        if self.layers.values().any(|l| l.validated == CompositionType::Client) {
            self.total_stats.frames_flattened += 1;
        }

        Ok(self
            .layers
            .values()
            .filter(|layer| layer.validated != layer.requested)
            .map(|layer| (layer.id, layer.validated))
            .collect())
    }

    /// Take over the composition decided by the last validation
    pub fn accept_display_changes(&mut self) {
        for layer in self.layers.values_mut() {
            layer.requested = layer.validated;
        }
    }

    /// Show the validated frame.
    ///
    /// Returns the fence signaled once the frame is replaced, `None` if nothing was shown.
    /// A frame without any layer to show yields `None` and counts towards `total_frames`
    /// only, it is not a failed present.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    #[profiling::function]
    pub fn present_display(&mut self) -> Result<Option<OutFence>, DisplayError> {
        self.total_stats.total_frames += 1;
        match self.present_frame() {
            Ok(fence) => Ok(fence),
            Err(DisplayError::BadLayer) => Ok(None),
            Err(err) => {
                self.total_stats.failed_kms_present += 1;
                Err(err)
            }
        }
    }

    fn present_frame(&mut self) -> Result<Option<OutFence>, DisplayError> {
        let Some(compositor) = self.compositor.as_mut() else {
            return Ok(None);
        };
        let device = compositor.pipeline().device().device().clone();
        let order = sorted_layers(&self.layers);
        for id in &order {
            if let Some(layer) = self.layers.get_mut(id) {
                if layer.validated == CompositionType::Device {
                    layer.import(&device, &*self.importer);
                }
            }
        }
        self.client_layer.import(&device, &*self.importer);

        let layers = frame_layers(&self.layers, &order, &self.client_layer, true)?;
        if layers.is_empty() {
            return Err(DisplayError::BadLayer);
        }

        let outcome = compositor.plan_and_commit(layers, CommitMode::Real).map_err(|err| {
            match err.kind() {
                ErrorKind::InternalFault => error!(%err, "Failed to present frame"),
                _ => warn!(%err, "Frame was refused"),
            }
            DisplayError::BadParameter
        })?;

        self.release_fences.clear();
        if let Some(fence) = outcome.out_fence.as_ref() {
            match fence.as_fd().try_clone_to_owned() {
                Ok(release) => {
                    let release = Arc::new(release);
                    self.release_fences = outcome
                        .accepted
                        .iter()
                        .filter(|(_, id)| *id != CLIENT_TARGET)
                        .map(|(_, id)| (*id, release.clone()))
                        .collect();
                }
                Err(err) => warn!(?err, "Failed to duplicate present fence"),
            }
        }
        Ok(outcome.out_fence)
    }

    /// Fences of the layers shown by the last frame
    pub fn release_fences(&self) -> Vec<(LayerId, Arc<OwnedFd>)> {
        self.release_fences.clone()
    }

    /// Config ids of this display
    pub fn configs(&self) -> Vec<u32> {
        self.configs.ids()
    }

    /// Value of an attribute of a config
    pub fn display_attribute(&self, config: u32, attribute: Attribute) -> Result<i32, DisplayError> {
        self.configs
            .get(config)
            .map(|config| config.attribute(attribute))
            .ok_or(DisplayError::BadConfig)
    }

    /// The active config
    pub fn active_config(&self) -> Result<u32, DisplayError> {
        self.configs
            .active()
            .map(|config| config.id)
            .ok_or(DisplayError::BadConfig)
    }

    /// Switch to another config with the next frame
    pub fn set_active_config(&mut self, id: u32) -> Result<(), DisplayError> {
        let config = self.configs.get(id).cloned().ok_or(DisplayError::BadConfig)?;
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.stage_mode(config.mode.clone());
        }
        self.configs.set_active(id);
        let (width, height) = config.mode.size();
        self.client_layer
            .set_display_frame(Rectangle::from_size((width as i32, height as i32).into()));
        if let Some(vsync) = self.vsync.as_ref() {
            vsync.set_period(config.mode.vsync_period());
        }
        self.flattening.set_period(config.mode.vsync_period());
        debug!(parent: &self.span, config = id, mode = ?config.mode, "Active config changed");
        Ok(())
    }

    /// Current power mode
    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    /// Change the power mode
    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), DisplayError> {
        let commit = match mode {
            PowerMode::Off => CommitMode::PowerOff,
            PowerMode::On => CommitMode::PowerOn,
            PowerMode::Doze | PowerMode::DozeSuspend => return Err(DisplayError::Unsupported),
        };
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.plan_and_commit(Vec::new(), commit).map_err(|err| {
                warn!(parent: &self.span, %err, ?mode, "Failed to change power mode");
                DisplayError::BadParameter
            })?;
        }
        self.power_mode = mode;
        Ok(())
    }

    /// Whether low power modes are available
    pub fn supports_doze(&self) -> bool {
        false
    }

    /// Start or stop vsync callbacks
    pub fn set_vsync_enabled(&mut self, enabled: bool) -> Result<(), DisplayError> {
        match self.vsync.as_ref() {
            Some(vsync) => {
                vsync.enable(enabled);
                Ok(())
            }
            None => Err(DisplayError::Unsupported),
        }
    }

    /// Supported color modes
    pub fn color_modes(&self) -> Vec<ColorMode> {
        vec![ColorMode::Native]
    }

    /// Current color mode
    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    /// Change the color mode, only [`ColorMode::Native`] is supported
    pub fn set_color_mode(&mut self, mode: ColorMode) -> Result<(), DisplayError> {
        match mode {
            ColorMode::Native => {
                self.color_mode = mode;
                Ok(())
            }
            _ => Err(DisplayError::Unsupported),
        }
    }

    /// HDR support, always empty
    pub fn hdr_capabilities(&self) -> HdrCapabilities {
        HdrCapabilities::default()
    }

    /// How the display is attached
    pub fn connection_type(&self) -> Result<ConnectionType, DisplayError> {
        let info = self
            .manager
            .connector_info(self.connector)
            .ok_or(DisplayError::BadDisplay)?;
        match info.kind {
            ConnectorKind::Internal => Ok(ConnectionType::Internal),
            ConnectorKind::External => Ok(ConnectionType::External),
            _ => Err(DisplayError::BadConfig),
        }
    }

    /// Name reported to the host
    pub fn name(&self) -> String {
        let id = self
            .manager
            .connector_info(self.connector)
            .map(|info| info.id)
            .unwrap_or_default();
        format!("display-{}", id)
    }

    /// Port and EDID of the connected sink
    pub fn identification_data(&self) -> Result<(u8, Vec<u8>), DisplayError> {
        let info = self
            .manager
            .connector_info(self.connector)
            .ok_or(DisplayError::BadDisplay)?;
        match self.manager.edid(self.connector) {
            Ok(Some(edid)) => Ok((info.id as u8, edid)),
            Ok(None) => Err(DisplayError::Unsupported),
            Err(err) => {
                warn!(parent: &self.span, %err, "Failed to read EDID");
                Err(DisplayError::Unsupported)
            }
        }
    }

    /// Turn the display off and forget what was shown
    pub fn clear_display(&mut self) {
        if let Some(compositor) = self.compositor.as_mut() {
            if let Err(err) = compositor.clear_display() {
                warn!(parent: &self.span, %err, "Failed to clear display");
            }
        }
        self.release_fences.clear();
    }

    /// Statistics since boot and since the previous dump
    pub fn dump(&mut self) -> String {
        let name = self
            .manager
            .connector_info(self.connector)
            .map(|info| info.name)
            .unwrap_or_default();
        let delta = self.total_stats.minus(&self.prev_stats);
        let out = format!(
            "- Display on: {}\n  Flattening state: {}\nStatistics since system boot:\n{}\n\nStatistics since last dumpsys request:\n{}\n\n",
            name,
            self.flattening.state(),
            self.total_stats.dump(),
            delta.dump()
        );
        self.prev_stats = self.total_stats;
        out
    }
}

fn requires_scaling(layer: &DisplayLayer) -> bool {
    let src = layer.transform.transform_size(layer.src.size);
    (src.w - layer.dst.size.w as f64).abs() > f64::EPSILON || (src.h - layer.dst.size.h as f64).abs() > f64::EPSILON
}
