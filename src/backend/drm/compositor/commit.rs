use std::sync::Arc;

use scopeguard::ScopeGuard;
use tracing::{debug, error, info_span, instrument, trace, warn};

use super::{Composition, CompositionError, FrameState, Layer, LayerId};
use crate::backend::drm::device::{AtomicRequest, CommitFlags, KmsDevice, ObjectType, OutFence};
use crate::backend::drm::error::Error;
use crate::backend::drm::mode::Mode;
use crate::backend::drm::pipeline::DisplayPipeline;
use crate::backend::drm::properties::PropertyStore;
use crate::backend::drm::registry::{Crtc, Plane, PlaneHandle};
use crate::utils::{to_fixed, Transform};

const DPMS_ON: u64 = 0;

/// What a call to [`DisplayCompositor::plan_and_commit`] does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitMode {
    /// Check the planned state without applying it
    Test,
    /// Apply the planned state, blocking until the kernel accepted it
    Real,
    /// Deactivate the crtc
    PowerOff,
    /// Switch the connector on through its `DPMS` property
    PowerOn,
}

/// Everything a single atomic commit may change
#[derive(Debug, Default)]
pub struct AtomicCommitArgs {
    /// New mode of the crtc
    pub display_mode: Option<Mode>,
    /// New activation state of the crtc
    pub active: Option<bool>,
    /// Planes to show
    pub composition: Option<Composition>,
    /// Only test the state
    pub test_only: bool,
    /// Disable every plane of the pipeline
    pub clear_active_composition: bool,
}

/// Result of [`DisplayCompositor::plan_and_commit`]
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// Planes and their layers
    pub accepted: Vec<(PlaneHandle, LayerId)>,
    /// Layers left to client composition
    pub rejected: Vec<LayerId>,
    /// Fence of a real commit
    pub out_fence: Option<OutFence>,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    struct DrmRotation: u8 {
        const ROTATE_0      =   0b00000001;
        const ROTATE_90     =   0b00000010;
        const ROTATE_180    =   0b00000100;
        const ROTATE_270    =   0b00001000;
        const REFLECT_X     =   0b00010000;
        const REFLECT_Y     =   0b00100000;
    }
}

impl From<Transform> for DrmRotation {
    fn from(transform: Transform) -> Self {
        match transform {
            Transform::Normal => DrmRotation::ROTATE_0,
            Transform::_90 => DrmRotation::ROTATE_90,
            Transform::_180 => DrmRotation::ROTATE_180,
            Transform::_270 => DrmRotation::ROTATE_270,
            Transform::Flipped => DrmRotation::REFLECT_Y,
            Transform::Flipped90 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_90,
            Transform::Flipped180 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_180,
            Transform::Flipped270 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_270,
        }
    }
}

/// Composition engine of one [`DisplayPipeline`]
///
/// Keeps the mode staged for the next commit, the mode blob and the composition last
/// applied, so the framebuffers being scanned out stay alive.
#[derive(Debug)]
pub struct DisplayCompositor {
    pipeline: Arc<DisplayPipeline>,
    staged_mode: Option<Mode>,
    active_mode_blob: Option<u32>,
    active_composition: Option<Composition>,
    crtc_active: bool,
    state: FrameState,
    span: tracing::Span,
}

impl DisplayCompositor {
    /// Create a compositor for `pipeline`
    pub fn new(pipeline: Arc<DisplayPipeline>) -> DisplayCompositor {
        let span = info_span!(
            "drm_compositor",
            connector = %pipeline.connector().name(),
            crtc = pipeline.crtc().id()
        );
        DisplayCompositor {
            pipeline,
            staged_mode: None,
            active_mode_blob: None,
            active_composition: None,
            crtc_active: false,
            state: FrameState::Idle,
            span,
        }
    }

    /// The pipeline this compositor drives
    pub fn pipeline(&self) -> &Arc<DisplayPipeline> {
        &self.pipeline
    }

    /// Use `mode` with the next commit
    pub fn stage_mode(&mut self, mode: Mode) {
        debug!(parent: &self.span, ?mode, "Staging mode");
        self.staged_mode = Some(mode);
    }

    /// Mode waiting for the next real commit
    pub fn staged_mode(&self) -> Option<&Mode> {
        self.staged_mode.as_ref()
    }

    /// Progress of the current frame
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Whether the crtc was activated by the last successful commits
    pub fn is_active(&self) -> bool {
        self.crtc_active
    }

    /// Composition currently scanned out
    pub fn active_composition(&self) -> Option<&Composition> {
        self.active_composition.as_ref()
    }

    /// Planes available for layers: the primary plane and the overlays
    pub fn plane_count(&self) -> usize {
        1 + self.pipeline.overlay_plane_handles().len()
    }

    /// Plan `layers` and test or apply the result, or change the power state of the display.
    ///
    /// In [`CommitMode::Real`] a plan leaving layers without a plane is refused before
    /// the device is touched. The staged mode is cleared once a real commit succeeded.
    #[instrument(level = "debug", parent = &self.span, skip(self, layers))]
    pub fn plan_and_commit(&mut self, layers: Vec<Layer>, mode: CommitMode) -> Result<CommitOutcome, CompositionError> {
        match mode {
            CommitMode::PowerOff => {
                self.execute(AtomicCommitArgs {
                    active: Some(false),
                    ..Default::default()
                })?;
                Ok(CommitOutcome::default())
            }
            CommitMode::PowerOn => {
                self.activate_display_using_dpms()?;
                Ok(CommitOutcome::default())
            }
            CommitMode::Test | CommitMode::Real => {
                if layers.is_empty() {
                    return Err(CompositionError::Empty);
                }
                let composition = Composition::new(
                    self.pipeline.crtc_handle(),
                    layers,
                    self.pipeline.primary_plane_handle(),
                    self.pipeline.overlay_plane_handles(),
                );
                let accepted = composition.plan().assignments.clone();
                let rejected = composition.plan().rejected.clone();
                if mode == CommitMode::Real && !rejected.is_empty() {
                    debug!(rejected = rejected.len(), "Refusing incomplete plan");
                    return Err(CompositionError::Rejected(rejected));
                }

                let test_only = mode == CommitMode::Test;
                let out_fence = self.execute(AtomicCommitArgs {
                    display_mode: self.staged_mode.clone(),
                    composition: Some(composition),
                    test_only,
                    ..Default::default()
                })?;
                if !test_only {
                    self.staged_mode = None;
                }

                Ok(CommitOutcome {
                    accepted,
                    rejected,
                    out_fence,
                })
            }
        }
    }

    /// Build and execute one atomic request.
    ///
    /// Returns the out-fence of a real commit.
    #[instrument(level = "trace", parent = &self.span, skip_all, fields(test_only = args.test_only))]
    #[profiling::function]
    pub fn execute(&mut self, args: AtomicCommitArgs) -> Result<Option<OutFence>, CompositionError> {
        let pipeline = self.pipeline.clone();
        let registry = pipeline.device();
        let device = registry.device().clone();
        let connector = pipeline.connector();
        let crtc = pipeline.crtc();
        let connector_crtc_id = connector
            .property("CRTC_ID")
            .ok_or(Error::UnknownProperty {
                object: ObjectType::Connector,
                id: connector.id(),
                name: "CRTC_ID",
            })?
            .handle;

        let mut req = AtomicRequest::new();
        let mut flags = CommitFlags::empty();

        let activate = match args.active {
            Some(active) => Some(active),
            None if args.display_mode.is_some() => Some(true),
            None if args.composition.is_some() && !self.crtc_active => Some(true),
            None => None,
        };
        if let Some(active) = activate {
            req.add_property(crtc.id(), crtc_prop(crtc, "ACTIVE")?, active as u64);
            req.add_property(connector.id(), connector_crtc_id, if active { crtc.id() as u64 } else { 0 });
            if active != self.crtc_active {
                flags |= CommitFlags::ALLOW_MODESET;
            }
        }

        let mut new_blob = None;
        if let Some(mode) = args.display_mode.as_ref() {
            let blob = device.create_mode_blob(mode)?;
            let blob_device = device.clone();
            let blob = scopeguard::guard(blob, move |blob| destroy_blob(&blob_device, blob));
            req.add_property(crtc.id(), crtc_prop(crtc, "MODE_ID")?, *blob as u64);
            req.add_property(connector.id(), connector_crtc_id, crtc.id() as u64);
            flags |= CommitFlags::ALLOW_MODESET;
            new_blob = Some(blob);
        }

        let clear = args.clear_active_composition || activate == Some(false);
        let mut used: Vec<PlaneHandle> = Vec::new();
        if let (Some(composition), false) = (args.composition.as_ref(), clear) {
            for (zpos, (handle, layer)) in composition.planes().enumerate() {
                let plane = registry
                    .plane(handle)
                    .ok_or(Error::UnknownObject(ObjectType::Plane, handle.index() as u32))?;
                set_plane_state(&mut req, plane, crtc, layer, zpos as u64)?;
                used.push(handle);
            }
        }
        if clear || args.composition.is_some() {
            for plane in pipeline.planes().filter(|plane| !used.contains(&plane.handle())) {
                disable_plane(&mut req, plane)?;
            }
        }

        if args.test_only {
            flags |= CommitFlags::TEST_ONLY;
            self.state = FrameState::Validating;
        } else {
            req.request_out_fence(crtc.id(), crtc_prop(crtc, "OUT_FENCE_PTR")?);
            self.state = FrameState::Committing;
        }

        trace!(properties = req.len(), ?flags, "Submitting atomic request");
        let result = device.atomic_commit(&req, flags);
        self.state = FrameState::Idle;

        let fence = match result {
            Ok(fence) => fence,
            Err(err) if args.test_only => {
                debug!(%err, "Test commit rejected");
                return Err(CompositionError::TestFailed(err));
            }
            Err(err) => {
                error!(%err, "Failed to apply the frame composition");
                return Err(CompositionError::CommitFailed(err));
            }
        };
        if args.test_only {
            return Ok(None);
        }

        if let Some(blob) = new_blob {
            let blob = ScopeGuard::into_inner(blob);
            if let Some(old) = self.active_mode_blob.replace(blob) {
                destroy_blob(&device, old);
            }
            connector.set_active_mode(args.display_mode);
        }
        if let Some(active) = activate {
            self.crtc_active = active;
        }
        if clear {
            self.active_composition = None;
        } else if args.composition.is_some() {
            self.active_composition = args.composition;
        }

        Ok(fence.map(OutFence::from))
    }

    /// Switch the connector on through its `DPMS` property.
    ///
    /// The crtc itself is activated by the next frame.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn activate_display_using_dpms(&self) -> Result<(), CompositionError> {
        let connector = self.pipeline.connector();
        let dpms = connector.property("DPMS").ok_or(Error::UnknownProperty {
            object: ObjectType::Connector,
            id: connector.id(),
            name: "DPMS",
        })?;
        self.pipeline
            .device()
            .device()
            .set_property(connector.id(), ObjectType::Connector, dpms.handle, DPMS_ON)?;
        Ok(())
    }

    /// Disable every plane of the pipeline
    pub fn clear_display(&mut self) -> Result<(), CompositionError> {
        self.execute(AtomicCommitArgs {
            clear_active_composition: true,
            ..Default::default()
        })
        .map(|_| ())
    }
}

impl Drop for DisplayCompositor {
    fn drop(&mut self) {
        if let Some(blob) = self.active_mode_blob.take() {
            destroy_blob(self.pipeline.device().device(), blob);
        }
    }
}

fn destroy_blob(device: &Arc<dyn KmsDevice>, blob: u32) {
    if let Err(err) = device.destroy_blob(blob) {
        warn!(blob, %err, "Failed to destroy mode blob");
    }
}

fn required(props: &PropertyStore, object: ObjectType, id: u32, name: &'static str) -> Result<u32, Error> {
    props
        .handle(name)
        .ok_or(Error::UnknownProperty { object, id, name })
}

fn crtc_prop(crtc: &Crtc, name: &'static str) -> Result<u32, Error> {
    required(crtc.props(), ObjectType::Crtc, crtc.id(), name)
}

fn plane_prop(plane: &Plane, name: &'static str) -> Result<u32, Error> {
    required(plane.props(), ObjectType::Plane, plane.id(), name)
}

fn set_plane_state(
    req: &mut AtomicRequest,
    plane: &Plane,
    crtc: &Crtc,
    layer: &Layer,
    zpos: u64,
) -> Result<(), CompositionError> {
    let fb = layer
        .framebuffer
        .as_ref()
        .ok_or(CompositionError::MissingFramebuffer(layer.id))?;
    let id = plane.id();
    let props = plane.props();

    req.add_property(id, plane_prop(plane, "CRTC_ID")?, crtc.id() as u64);
    req.add_property(id, plane_prop(plane, "FB_ID")?, fb.id() as u64);

    // these are 16.16. fixed point
    req.add_property(id, plane_prop(plane, "SRC_X")?, to_fixed(layer.src.loc.x) as u64);
    req.add_property(id, plane_prop(plane, "SRC_Y")?, to_fixed(layer.src.loc.y) as u64);
    req.add_property(id, plane_prop(plane, "SRC_W")?, to_fixed(layer.src.size.w) as u64);
    req.add_property(id, plane_prop(plane, "SRC_H")?, to_fixed(layer.src.size.h) as u64);

    req.add_property(id, plane_prop(plane, "CRTC_X")?, layer.dst.loc.x as i64 as u64);
    req.add_property(id, plane_prop(plane, "CRTC_Y")?, layer.dst.loc.y as i64 as u64);
    req.add_property(id, plane_prop(plane, "CRTC_W")?, layer.dst.size.w as u64);
    req.add_property(id, plane_prop(plane, "CRTC_H")?, layer.dst.size.h as u64);

    if let Some(prop) = props.handle("zpos") {
        req.add_property(id, prop, zpos);
    }
    if let Some(prop) = props.handle("rotation") {
        req.add_property(id, prop, DrmRotation::from(layer.transform).bits() as u64);
    } else if layer.transform != Transform::Normal {
        // without the property only the identity transform is guaranteed to work
        return Err(Error::UnknownProperty {
            object: ObjectType::Plane,
            id,
            name: "rotation",
        }
        .into());
    }
    if let Some(prop) = props.handle("alpha") {
        req.add_property(id, prop, (layer.alpha.clamp(0.0, 1.0) * u16::MAX as f32).round() as u64);
    } else if layer.alpha != 1.0 {
        return Err(Error::UnknownProperty {
            object: ObjectType::Plane,
            id,
            name: "alpha",
        }
        .into());
    }
    if let Some(prop) = props.handle("pixel blend mode") {
        req.add_property(id, prop, layer.blend.raw());
    }
    if let Some(prop) = props.handle("IN_FENCE_FD") {
        let fence = layer
            .acquire_fence
            .as_ref()
            .map(|fence| std::os::unix::io::AsRawFd::as_raw_fd(&**fence) as i64)
            .unwrap_or(-1);
        req.add_property(id, prop, fence as u64);
    } else if layer.acquire_fence.is_some() {
        return Err(Error::UnknownProperty {
            object: ObjectType::Plane,
            id,
            name: "IN_FENCE_FD",
        }
        .into());
    }
    Ok(())
}

fn disable_plane(req: &mut AtomicRequest, plane: &Plane) -> Result<(), Error> {
    req.add_property(plane.id(), plane_prop(plane, "FB_ID")?, 0);
    req.add_property(plane.id(), plane_prop(plane, "CRTC_ID")?, 0);
    Ok(())
}
