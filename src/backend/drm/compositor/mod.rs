//! Plane assignment and atomic commits of a display pipeline
//!
//! A [`DisplayCompositor`] is bound to one [`DisplayPipeline`](super::DisplayPipeline).
//! Every frame the host hands in a set of [`Layer`]s, which [`plan`] distributes onto
//! the planes of the pipeline: the bottom-most layer goes to the primary plane, the
//! following layers go to the overlay planes in ascending z-order, anything left over
//! is rejected and has to be composited by the client.
//!
//! The resulting [`Composition`] is first tested with a test-only commit and then
//! applied with a blocking real commit, which hands back an [`OutFence`](super::OutFence)
//! signaled once the previous buffers are released.
//!
//! ```rust,ignore
//! let mut compositor = DisplayCompositor::new(pipeline);
//! compositor.stage_mode(mode);
//! let outcome = compositor.plan_and_commit(layers.clone(), CommitMode::Test)?;
//! if outcome.rejected.is_empty() {
//!     let outcome = compositor.plan_and_commit(layers, CommitMode::Real)?;
//!     let fence = outcome.out_fence;
//! }
//! ```

use std::ops::Range;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use tracing::trace;

use super::buffer::Framebuffer;
use super::error::{Error, ErrorKind};
use super::registry::{CrtcHandle, PlaneHandle};
use crate::utils::{Buffer as BufferCoords, Physical, Rectangle, Transform};

mod commit;
mod stats;

pub use self::commit::{AtomicCommitArgs, CommitMode, CommitOutcome, DisplayCompositor};
pub use self::stats::Stats;

/// Identifier of a layer, chosen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

/// How a layer is composited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompositionType {
    /// Scanned out by a hardware plane
    #[default]
    Device,
    /// Rendered by the client into the client target
    Client,
}

/// Blending of a layer with the layers below
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// Opaque, the alpha channel is ignored
    None,
    /// Color channels are premultiplied by alpha
    #[default]
    Premultiplied,
    /// Color channels are not premultiplied
    Coverage,
}

impl BlendMode {
    /// Value of the `pixel blend mode` plane property
    pub fn raw(&self) -> u64 {
        match self {
            BlendMode::Premultiplied => 0,
            BlendMode::Coverage => 1,
            BlendMode::None => 2,
        }
    }
}

/// An image placed on the display
#[derive(Debug, Clone)]
pub struct Layer {
    /// Identifier of the layer
    pub id: LayerId,
    /// Framebuffer holding the contents
    pub framebuffer: Option<Arc<Framebuffer>>,
    /// Source crop, in buffer coordinates
    pub src: Rectangle<f64, BufferCoords>,
    /// Destination, in physical coordinates of the display
    pub dst: Rectangle<i32, Physical>,
    /// Blending
    pub blend: BlendMode,
    /// Plane alpha, `0.0..=1.0`
    pub alpha: f32,
    /// Position in the stack, higher is on top
    pub z_order: u32,
    /// Transformation applied by the plane
    pub transform: Transform,
    /// Fence to wait on before reading the buffer
    pub acquire_fence: Option<Arc<OwnedFd>>,
}

impl Layer {
    /// Create a layer showing all of `framebuffer` at `dst`
    pub fn new(id: LayerId, framebuffer: Arc<Framebuffer>, dst: Rectangle<i32, Physical>, z_order: u32) -> Layer {
        Layer {
            id,
            src: Rectangle::from_size(framebuffer.size().to_f64()),
            framebuffer: Some(framebuffer),
            dst,
            blend: BlendMode::default(),
            alpha: 1.0,
            z_order,
            transform: Transform::Normal,
            acquire_fence: None,
        }
    }

    /// Whether the plane has to scale the source to fit the destination
    pub fn requires_scaling(&self) -> bool {
        let src = self.transform.transform_size(self.src.size);
        (src.w - self.dst.size.w as f64).abs() > f64::EPSILON || (src.h - self.dst.size.h as f64).abs() > f64::EPSILON
    }
}

/// Assignment of layers to planes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositionPlan {
    /// Planes and the layer each of them scans out, bottom to top
    pub assignments: Vec<(PlaneHandle, LayerId)>,
    /// Layers without a plane
    pub rejected: Vec<LayerId>,
}

impl CompositionPlan {
    /// Plane assigned to `layer`
    pub fn plane_for(&self, layer: LayerId) -> Option<PlaneHandle> {
        self.assignments
            .iter()
            .find(|(_, id)| *id == layer)
            .map(|(plane, _)| *plane)
    }

    /// Whether every layer got a plane
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Distribute `layers` onto the planes of a pipeline.
///
/// The layer with the lowest z-order goes to the primary plane, the next layers go to
/// the overlays in the order given. Layers left over are rejected.
#[profiling::function]
pub fn plan(layers: &[Layer], primary: PlaneHandle, overlays: &[PlaneHandle]) -> CompositionPlan {
    let mut ordered: Vec<&Layer> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.z_order);

    let mut planes = std::iter::once(primary).chain(overlays.iter().copied());
    let mut result = CompositionPlan::default();
    for layer in ordered {
        match planes.next() {
            Some(plane) => result.assignments.push((plane, layer.id)),
            None => result.rejected.push(layer.id),
        }
    }
    trace!(
        assigned = result.assignments.len(),
        rejected = result.rejected.len(),
        "Planned composition"
    );
    result
}

/// Choose the range of z-ordered layers composited by the client.
///
/// `needs_client` tells for every layer, bottom to top, whether it can not be scanned
/// out directly. The returned range covers all of those and is widened until the
/// remaining layers plus one client target fit onto `planes` planes, first towards the
/// top of the stack, then towards the bottom.
pub fn client_range(needs_client: &[bool], planes: usize) -> Option<Range<usize>> {
    let total = needs_client.len();
    let first = needs_client.iter().position(|client| *client);
    let last = needs_client.iter().rposition(|client| *client);
    let mut range = match (first, last) {
        (Some(first), Some(last)) => Some(first..last + 1),
        _ => None,
    };

    loop {
        let entries = match &range {
            Some(range) => total - range.len() + 1,
            None => total,
        };
        if entries <= planes.max(1) {
            return range;
        }
        range = Some(match range {
            // the planner rejects from the top, start at the first rejected entry
            None => planes.min(total - 1)..planes.min(total - 1) + 1,
            Some(range) if range.end < total => range.start..range.end + 1,
            Some(range) => range.start - 1..range.end,
        });
    }
}

/// Layers of one frame together with their plane assignment, bound to a crtc
#[derive(Debug)]
pub struct Composition {
    crtc: CrtcHandle,
    layers: Vec<Layer>,
    plan: CompositionPlan,
}

impl Composition {
    /// Plan `layers` for a pipeline
    pub fn new(crtc: CrtcHandle, layers: Vec<Layer>, primary: PlaneHandle, overlays: &[PlaneHandle]) -> Composition {
        let plan = plan(&layers, primary, overlays);
        Composition { crtc, layers, plan }
    }

    /// The crtc this composition is bound to
    pub fn crtc(&self) -> CrtcHandle {
        self.crtc
    }

    /// The plane assignment
    pub fn plan(&self) -> &CompositionPlan {
        &self.plan
    }

    /// Lookup a layer
    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    /// All layers
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Planes with their layers, bottom to top
    pub fn planes(&self) -> impl Iterator<Item = (PlaneHandle, &Layer)> {
        self.plan
            .assignments
            .iter()
            .filter_map(move |(plane, id)| self.layer(*id).map(|layer| (*plane, layer)))
    }
}

/// Progress of the current frame of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameState {
    /// No frame in flight
    #[default]
    Idle,
    /// A test commit is running
    Validating,
    /// A real commit is running
    Committing,
}

/// Errors of the planner and the committer
#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    /// The frame has no layers
    #[error("The composition has no layers")]
    Empty,
    /// Not every layer got a plane
    #[error("{} layers could not be assigned to a plane", .0.len())]
    Rejected(Vec<LayerId>),
    /// A layer has no framebuffer
    #[error("Layer {0:?} has no framebuffer")]
    MissingFramebuffer(LayerId),
    /// The kernel refused the state in a test commit
    #[error("The test commit was rejected")]
    TestFailed(#[source] Error),
    /// The kernel refused a state that passed the test commit
    #[error("The commit failed")]
    CommitFailed(#[source] Error),
    /// The operation is not supported
    #[error("Unsupported operation")]
    Unsupported,
    /// The device failed
    #[error(transparent)]
    Device(#[from] Error),
}

impl CompositionError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompositionError::Empty
            | CompositionError::Rejected(_)
            | CompositionError::MissingFramebuffer(_)
            | CompositionError::TestFailed(_)
            | CompositionError::Unsupported => ErrorKind::ConfigRejection,
            CompositionError::CommitFailed(_) => ErrorKind::InternalFault,
            CompositionError::Device(err) => err.kind(),
        }
    }
}
