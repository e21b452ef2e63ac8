use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use super::ownership::{Claimant, ClaimTransaction, ObjectKey};
use super::registry::{
    Connector, ConnectorHandle, Crtc, CrtcHandle, DeviceRegistry, EncoderHandle, Plane, PlaneHandle, PlaneType,
};
use super::OwnershipTracker;

/// A connector bound to an encoder, a crtc, a primary plane and zero or more overlays
///
/// All objects are claimed by the connector for the lifetime of the pipeline. Pipelines
/// are only created by [`assemble`] and handed back to the
/// [`ResourceManager`](super::ResourceManager) for teardown.
#[derive(Debug)]
pub struct DisplayPipeline {
    device: Arc<DeviceRegistry>,
    connector: ConnectorHandle,
    encoder: EncoderHandle,
    crtc: CrtcHandle,
    primary_plane: PlaneHandle,
    overlay_planes: SmallVec<[PlaneHandle; 4]>,
}

impl DisplayPipeline {
    /// Registry of the device this pipeline lives on
    pub fn device(&self) -> &Arc<DeviceRegistry> {
        &self.device
    }

    /// Handle of the connector
    pub fn connector_handle(&self) -> ConnectorHandle {
        self.connector
    }

    /// Handle of the encoder
    pub fn encoder_handle(&self) -> EncoderHandle {
        self.encoder
    }

    /// Handle of the crtc
    pub fn crtc_handle(&self) -> CrtcHandle {
        self.crtc
    }

    /// Handle of the primary plane
    pub fn primary_plane_handle(&self) -> PlaneHandle {
        self.primary_plane
    }

    /// Handles of the overlay planes, in discovery order
    pub fn overlay_plane_handles(&self) -> &[PlaneHandle] {
        &self.overlay_planes
    }

    /// The connector
    pub fn connector(&self) -> &Connector {
        // handles of a pipeline always come from its own registry
        &self.device.connectors()[self.connector.index()]
    }

    /// The crtc
    pub fn crtc(&self) -> &Crtc {
        &self.device.crtcs()[self.crtc.index()]
    }

    /// The primary plane
    pub fn primary_plane(&self) -> &Plane {
        &self.device.planes()[self.primary_plane.index()]
    }

    /// The primary plane followed by the overlays
    pub fn planes(&self) -> impl Iterator<Item = &Plane> {
        std::iter::once(self.primary_plane)
            .chain(self.overlay_planes.iter().copied())
            .map(move |handle| &self.device.planes()[handle.index()])
    }

    /// Every object claimed for this pipeline
    pub fn claimed_objects(&self) -> Vec<ObjectKey> {
        let mut objects = vec![
            ObjectKey::Encoder(self.encoder),
            ObjectKey::Crtc(self.crtc),
            ObjectKey::Plane(self.primary_plane),
        ];
        objects.extend(self.overlay_planes.iter().map(|plane| ObjectKey::Plane(*plane)));
        objects
    }
}

/// Find and claim a pipeline for `connector`.
///
/// Encoders are tried starting with the one currently bound to the connector, then all
/// compatible encoders in discovery order. For each encoder its current crtc is tried
/// first, then every crtc it can drive. The first combination with a free encoder, a free
/// crtc and a free primary plane wins. Claims of failed attempts are released.
pub fn assemble(
    registry: &Arc<DeviceRegistry>,
    tracker: &mut OwnershipTracker,
    connector: ConnectorHandle,
    use_overlay_planes: bool,
) -> Option<DisplayPipeline> {
    let _guard = registry.span().enter();
    let conn = registry.connector(connector)?;
    let status = conn.status();

    let mut encoders: SmallVec<[EncoderHandle; 4]> = SmallVec::new();
    encoders.extend(status.current_encoder);
    for encoder in registry.encoders() {
        let handle = encoder.handle();
        if conn.supports_encoder(handle) && !encoders.contains(&handle) {
            encoders.push(handle);
        }
    }

    let mut tx = tracker.transaction(Claimant::Connector(connector));
    for encoder_handle in encoders {
        let Some(encoder) = registry.encoder(encoder_handle) else {
            continue;
        };

        let mut crtcs: SmallVec<[CrtcHandle; 4]> = SmallVec::new();
        crtcs.extend(encoder.current_crtc());
        for crtc in registry.crtcs() {
            if encoder.supports_crtc(crtc) && !crtcs.contains(&crtc.handle()) {
                crtcs.push(crtc.handle());
            }
        }

        for crtc_handle in crtcs {
            let Some(crtc) = registry.crtc(crtc_handle) else {
                continue;
            };
            let mark = tx.mark();
            if let Some(pipeline) = try_pair(registry, &mut tx, connector, encoder_handle, crtc, use_overlay_planes) {
                tx.commit();
                info!(
                    connector = %conn.name(),
                    encoder = encoder.id(),
                    crtc = crtc.id(),
                    overlays = pipeline.overlay_planes.len(),
                    "Pipeline assembled"
                );
                return Some(pipeline);
            }
            tx.rollback_to(mark);
        }
    }

    error!(connector = %conn.name(), "Could not find a suitable encoder/crtc");
    None
}

fn try_pair(
    registry: &Arc<DeviceRegistry>,
    tx: &mut ClaimTransaction<'_>,
    connector: ConnectorHandle,
    encoder: EncoderHandle,
    crtc: &Crtc,
    use_overlay_planes: bool,
) -> Option<DisplayPipeline> {
    if let Err(err) = tx.acquire(encoder) {
        trace!(%err, "Encoder unavailable");
        return None;
    }
    if let Err(err) = tx.acquire(crtc.handle()) {
        trace!(%err, "Crtc unavailable");
        return None;
    }

    let mut primary_planes: SmallVec<[&Plane; 2]> = SmallVec::new();
    let mut overlay_planes: SmallVec<[&Plane; 4]> = SmallVec::new();
    for plane in registry.planes().iter().filter(|plane| plane.supports_crtc(crtc)) {
        match plane.plane_type() {
            PlaneType::Primary => primary_planes.push(plane),
            PlaneType::Overlay => overlay_planes.push(plane),
            PlaneType::Cursor => debug!(plane = plane.id(), "Ignoring cursor plane"),
        }
    }

    let primary = match primary_planes.as_slice() {
        [] => {
            error!(crtc = crtc.id(), "Primary plane for crtc not found");
            return None;
        }
        [primary] => *primary,
        _ => {
            error!(crtc = crtc.id(), "Found more than 1 primary plane for crtc");
            return None;
        }
    };
    if let Err(err) = tx.acquire(primary.handle()) {
        warn!(plane = primary.id(), %err, "Primary plane is already owned");
        return None;
    }

    let mut overlays = SmallVec::new();
    if use_overlay_planes {
        for plane in overlay_planes {
            if tx.acquire(plane.handle()).is_ok() {
                overlays.push(plane.handle());
            } else {
                trace!(plane = plane.id(), "Skipping owned overlay plane");
            }
        }
    }

    Some(DisplayPipeline {
        device: registry.clone(),
        connector,
        encoder,
        crtc: crtc.handle(),
        primary_plane: primary.handle(),
        overlay_planes: overlays,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::registry::{ConnectorInterface, DeviceId};
    use crate::backend::drm::test::{DummyDevice, Topology};
    use std::collections::HashSet;

    fn registry(topology: Topology) -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(DeviceId(0), Arc::new(DummyDevice::new(topology))).unwrap())
    }

    #[test]
    fn owned_encoder_falls_through_to_next() {
        let registry = registry(
            Topology::new()
                .crtc()
                .crtc()
                .encoder(0b01, None)
                .encoder(0b10, None)
                .connector(ConnectorInterface::HDMIA, 1, true, &[0, 1])
                .primary_plane(0b01)
                .primary_plane(0b10),
        );
        let mut tracker = OwnershipTracker::new();
        let e1 = registry.encoders()[0].handle();
        let other = ConnectorHandle::new(DeviceId(0), 7);
        tracker.acquire(e1, Claimant::Connector(other)).unwrap();

        let conn = registry.connectors()[0].handle();
        let pipeline = assemble(&registry, &mut tracker, conn, true).unwrap();
        assert_eq!(pipeline.encoder_handle(), registry.encoders()[1].handle());
        assert_eq!(pipeline.crtc_handle(), registry.crtcs()[1].handle());
        assert_eq!(tracker.owner_of(e1), Some(Claimant::Connector(other)));
    }

    #[test]
    fn encoders_are_tried_in_discovery_order() {
        let registry = registry(
            Topology::new()
                .crtc()
                .crtc()
                .encoder(0b01, None)
                .encoder(0b10, None)
                .connector(ConnectorInterface::HDMIA, 1, true, &[1, 0])
                .primary_plane(0b01)
                .primary_plane(0b10),
        );
        let mut tracker = OwnershipTracker::new();
        let pipeline = assemble(&registry, &mut tracker, registry.connectors()[0].handle(), true).unwrap();
        assert_eq!(pipeline.encoder_handle(), registry.encoders()[0].handle());
        assert_eq!(pipeline.crtc_handle(), registry.crtcs()[0].handle());
    }

    #[test]
    fn current_encoder_and_crtc_are_preferred() {
        let registry = registry(
            Topology::new()
                .crtc()
                .crtc()
                .encoder(0b11, None)
                .encoder(0b11, Some(1))
                .connector(ConnectorInterface::DisplayPort, 1, true, &[0, 1])
                .current_encoder(0, 1)
                .primary_plane(0b01)
                .primary_plane(0b10),
        );
        let mut tracker = OwnershipTracker::new();
        let pipeline = assemble(&registry, &mut tracker, registry.connectors()[0].handle(), true).unwrap();
        assert_eq!(pipeline.encoder_handle(), registry.encoders()[1].handle());
        assert_eq!(pipeline.crtc_handle(), registry.crtcs()[1].handle());
        assert_eq!(pipeline.primary_plane_handle(), registry.planes()[1].handle());
    }

    #[test]
    fn two_primaries_fail_without_leaking_claims() {
        let registry = registry(
            Topology::new()
                .crtc()
                .encoder(0b1, None)
                .connector(ConnectorInterface::HDMIA, 1, true, &[0])
                .connector(ConnectorInterface::DisplayPort, 1, true, &[0])
                .primary_plane(0b1)
                .primary_plane(0b1)
                .overlay_plane(0b1),
        );
        let mut tracker = OwnershipTracker::new();
        for conn in registry.connectors() {
            assert!(assemble(&registry, &mut tracker, conn.handle(), true).is_none());
            assert!(tracker.held_by(Claimant::Connector(conn.handle())).is_empty());
        }
        assert!(!tracker.is_owned(registry.crtcs()[0].handle()));
        assert!(!tracker.is_owned(registry.encoders()[0].handle()));
    }

    #[test]
    fn missing_primary_fails() {
        let registry = registry(
            Topology::new()
                .crtc()
                .encoder(0b1, None)
                .connector(ConnectorInterface::HDMIA, 1, true, &[0])
                .overlay_plane(0b1)
                .cursor_plane(0b1),
        );
        let mut tracker = OwnershipTracker::new();
        assert!(assemble(&registry, &mut tracker, registry.connectors()[0].handle(), true).is_none());
        assert!(tracker.held_by(Claimant::Connector(registry.connectors()[0].handle())).is_empty());
    }

    #[test]
    fn pipelines_hold_disjoint_resources() {
        let registry = registry(
            Topology::new()
                .crtc()
                .crtc()
                .encoder(0b11, None)
                .encoder(0b11, None)
                .connector(ConnectorInterface::EmbeddedDisplayPort, 1, true, &[0, 1])
                .connector(ConnectorInterface::HDMIA, 1, true, &[0, 1])
                .primary_plane(0b01)
                .primary_plane(0b10)
                .overlay_plane(0b11)
                .overlay_plane(0b11)
                .cursor_plane(0b11),
        );
        let mut tracker = OwnershipTracker::new();
        let first = assemble(&registry, &mut tracker, registry.connectors()[0].handle(), true).unwrap();
        let second = assemble(&registry, &mut tracker, registry.connectors()[1].handle(), true).unwrap();

        let a: HashSet<_> = first.claimed_objects().into_iter().collect();
        let b: HashSet<_> = second.claimed_objects().into_iter().collect();
        assert!(a.is_disjoint(&b));
        assert_eq!(first.overlay_plane_handles().len(), 2);
        assert!(second.overlay_plane_handles().is_empty());

        for pipeline in [&first, &second] {
            let primaries = pipeline
                .planes()
                .filter(|plane| plane.plane_type() == PlaneType::Primary)
                .count();
            assert_eq!(primaries, 1);
            assert!(pipeline.planes().all(|plane| plane.plane_type() != PlaneType::Cursor));
        }
    }

    #[test]
    fn overlays_can_be_disabled() {
        let registry = registry(
            Topology::new()
                .crtc()
                .encoder(0b1, None)
                .connector(ConnectorInterface::HDMIA, 1, true, &[0])
                .primary_plane(0b1)
                .overlay_plane(0b1),
        );
        let mut tracker = OwnershipTracker::new();
        let pipeline = assemble(&registry, &mut tracker, registry.connectors()[0].handle(), false).unwrap();
        assert!(pipeline.overlay_plane_handles().is_empty());
        assert!(!tracker.is_owned(registry.planes()[1].handle()));
    }
}
