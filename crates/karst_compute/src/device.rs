/// Execution limits the pipelines size their launches against.
///
/// On a real device these come from the driver; the host backend fills in
/// the conventional GPU-shaped figures and takes the compute-unit count
/// from the machine, so launch-geometry decisions (workgroup clamps,
/// wavefront rounding, local-memory checks) exercise the same code paths
/// either way.
#[derive(Debug, Clone, Copy)]
pub struct DeviceProfile {
    /// Largest workgroup a kernel may be launched with.
    pub max_workgroup_size: usize,
    /// Preferred execution width; global sizes are rounded up to this.
    pub wavefront: usize,
    /// Bytes of fast per-workgroup memory.
    pub local_memory: usize,
    /// Number of independent compute units.
    pub compute_units: usize,
}

impl DeviceProfile {
    /// Profile for the host backend.
    pub fn detect() -> Self {
        let compute_units = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_workgroup_size: 256,
            wavefront: 64,
            local_memory: 32 * 1024,
            compute_units,
        }
    }

    /// Workgroup size for a launch of `threads` work items: the device
    /// limit, clamped to 256 and to the launch itself.
    pub fn workgroup_for(&self, threads: usize) -> usize {
        self.max_workgroup_size.min(256).min(threads).max(1)
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::detect()
    }
}
