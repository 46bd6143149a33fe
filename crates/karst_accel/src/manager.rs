use std::sync::Arc;

use karst_compute::{ComputeResult, DeviceProfile};
use karst_math::{Camera, Contact, Ray};
use karst_scene::SceneBuffer;
use rayon::prelude::*;

use crate::{BvhManager, TwoLevelGridManager};

/// Common lifecycle of the acceleration structures.
///
/// `initialize` is idempotent and must run once per instance;
/// `initialize_frame` sizes the frame buffers; `construct` runs the build
/// pipeline; the `generate_*` calls trace rays against the constructed
/// structure. Calls out of order fail with
/// [`karst_compute::ComputeError::OutOfOrder`].
pub trait AccelerationStructure {
    fn initialize(&mut self) -> ComputeResult<()>;

    fn initialize_frame(&mut self) -> ComputeResult<()>;

    fn construct(&mut self) -> ComputeResult<()>;

    /// Trace one primary ray per camera pixel into the internal contact
    /// buffer, retrievable through [`Self::primary_contacts`].
    fn generate_contacts(&mut self, camera: &Camera) -> ComputeResult<()>;

    /// Trace caller-provided rays into a caller-provided contact buffer.
    fn generate_ray_contacts(&mut self, rays: &[Ray], contacts: &mut [Contact])
        -> ComputeResult<()>;

    /// The camera-indexed contact buffer of the last
    /// [`Self::generate_contacts`] call.
    fn primary_contacts(&self) -> &[Contact];
}

/// The available structure variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelKind {
    Bvh,
    TwoLevelGrid,
}

/// Build a manager of the requested kind over a scene.
pub fn create_manager(
    kind: AccelKind,
    scene: Arc<SceneBuffer>,
    profile: DeviceProfile,
) -> Box<dyn AccelerationStructure> {
    match kind {
        AccelKind::Bvh => Box::new(BvhManager::new(scene, profile)),
        AccelKind::TwoLevelGrid => Box::new(TwoLevelGridManager::new(scene, profile)),
    }
}

/// Generate one primary contact per camera pixel with `trace`.
pub(crate) fn trace_camera<F>(camera: &Camera, contacts: &mut Vec<Contact>, trace: F)
where
    F: Fn(&Ray) -> Contact + Sync,
{
    contacts.clear();
    contacts.resize(camera.pixel_count(), Contact::NONE);
    contacts
        .par_iter_mut()
        .enumerate()
        .for_each(|(pixel, contact)| {
            let ray = camera.generate_ray(pixel as u32);
            *contact = trace(&ray);
        });
}

/// Trace an arbitrary ray buffer with `trace`.
pub(crate) fn trace_rays<F>(rays: &[Ray], contacts: &mut [Contact], trace: F)
where
    F: Fn(&Ray) -> Contact + Sync,
{
    rays.par_iter()
        .zip(contacts.par_iter_mut())
        .for_each(|(ray, contact)| {
            *contact = trace(ray);
        });
}

/// Construction lifecycle states shared by both managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    New,
    Initialized,
    FrameReady,
    Constructed,
}

impl Lifecycle {
    pub(crate) fn require(
        self,
        at_least: Lifecycle,
        operation: &'static str,
        prerequisite: &'static str,
    ) -> ComputeResult<()> {
        if (self as u8) < (at_least as u8) {
            return Err(karst_compute::ComputeError::OutOfOrder {
                operation,
                prerequisite,
            });
        }
        Ok(())
    }
}
