// rayon-based shared-memory communication

pub struct RayonComm;

impl RayonComm {
    pub fn new() -> Self {
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_cpus::get())
            .build_global()
            .ok();
        RayonComm
    }
}

impl Default for RayonComm {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Comm for RayonComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {
        rayon::scope(|_| {});
    }
    fn all_reduce_sum(&self, x: f64) -> f64 {
        x // single address space
    }
    fn all_reduce_min(&self, x: f64) -> f64 {
        x
    }
    fn all_reduce_max(&self, x: f64) -> f64 {
        x
    }
    fn abort(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}
