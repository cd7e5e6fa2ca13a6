use std::sync::OnceLock;

/// Band heights are rounded up to a multiple of this many rows.
const ROW_GROUP: usize = 8;

/// When and how a surface conversion is split into row bands.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RowSplit {
    /// Surfaces below this many pixels convert on the calling thread.
    pub min_pixels: usize,
    /// Smallest band worth handing to a worker.
    pub min_band_pixels: usize,
    pub max_workers: usize,
}

impl RowSplit {
    /// Rows per band for a `width`×`height` surface on the conversion
    /// pool, or `None` to convert serially.
    pub(crate) fn band_rows(&self, width: usize, height: usize) -> Option<usize> {
        self.band_rows_for(pool_workers(self.max_workers), width, height)
    }

    fn band_rows_for(&self, workers: usize, width: usize, height: usize) -> Option<usize> {
        if workers <= 1 || width == 0 || width.saturating_mul(height) < self.min_pixels {
            return None;
        }
        let min_rows = self.min_band_pixels.div_ceil(width);
        let rows = height
            .div_ceil(workers)
            .max(min_rows)
            .next_multiple_of(ROW_GROUP);
        (height > rows).then_some(rows)
    }
}

pub(crate) fn pool_workers(max_workers: usize) -> usize {
    static CORES: OnceLock<usize> = OnceLock::new();
    let cores = *CORES.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    cores.min(max_workers.max(1))
}

/// Run `job` inside the shared conversion pool, or inline when the host
/// has a single core or the pool could not be built. The pool is created
/// on first use with `max_workers` threads at most.
pub(crate) fn run_on_pool<F>(max_workers: usize, job: F)
where
    F: FnOnce() + Send,
{
    static POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        let workers = pool_workers(max_workers);
        if workers <= 1 {
            return None;
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("snow-mirror-convert-{index}"))
            .build()
            .map_err(|err| log::warn!("conversion pool unavailable, converting inline: {err}"))
            .ok()
    });
    match pool {
        Some(pool) => pool.install(job),
        None => job(),
    }
}
