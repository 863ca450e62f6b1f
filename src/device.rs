//! Compute device selection and the dense matrix multiply kernel

use std::fmt::{self, Display};

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder, prelude::*};

/// Where tensor math runs
///
/// Selected once at startup and passed explicitly to everything that computes.
/// Work only stays within `threads()` when it runs inside the device's [`Device::thread_pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Single threaded
    Cpu,
    /// Matrix products are split by output rows across the current rayon pool
    Parallel { threads: usize },
}

impl Device {
    /// Picks the parallel device when more than one hardware thread is available
    pub fn detect() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_threads(threads)
    }

    pub fn with_threads(threads: usize) -> Self {
        if threads > 1 {
            Device::Parallel { threads }
        } else {
            Device::Cpu
        }
    }

    pub fn threads(&self) -> usize {
        match self {
            Device::Cpu => 1,
            Device::Parallel { threads } => *threads,
        }
    }

    /// A rayon pool with exactly `threads()` workers. Data loading and matrix
    /// products started inside `install` on this pool use no other threads.
    pub fn thread_pool(&self) -> Result<ThreadPool, ThreadPoolBuildError> {
        ThreadPoolBuilder::new()
            .num_threads(self.threads())
            .thread_name(|i| format!("device-{}", i))
            .build()
    }

    /// Computes `c = a * b` where `a` is `m x k` and `b` is `k x n`, both given
    /// as (row stride, column stride) views over row-major storage. `c` is
    /// overwritten and is always contiguous row-major `m x n`.
    ///
    /// Transposed operands are expressed by swapping strides.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn gemm(
        &self,
        m: usize,
        k: usize,
        n: usize,
        a: &[f32],
        a_strides: (usize, usize),
        b: &[f32],
        b_strides: (usize, usize),
        c: &mut [f32],
    ) {
        assert_eq!(c.len(), m * n);
        if m == 0 || n == 0 {
            return;
        }
        if k > 0 {
            assert!(a.len() > (m - 1) * a_strides.0 + (k - 1) * a_strides.1);
            assert!(b.len() > (k - 1) * b_strides.0 + (n - 1) * b_strides.1);
        }

        let rows_per_chunk = m.div_ceil(self.threads());
        if rows_per_chunk >= m {
            sgemm_rows(0, m, k, n, a, a_strides, b, b_strides, c);
            return;
        }
        c.par_chunks_mut(rows_per_chunk * n)
            .enumerate()
            .for_each(|(chunk, c_rows)| {
                let rows = c_rows.len() / n;
                sgemm_rows(chunk * rows_per_chunk, rows, k, n, a, a_strides, b, b_strides, c_rows);
            });
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Parallel { threads } => write!(f, "cpu ({} threads)", threads),
        }
    }
}

/// Multiplies rows `first_row..first_row + rows` of `a` by `b` into `c`
#[allow(clippy::too_many_arguments)]
fn sgemm_rows(
    first_row: usize,
    rows: usize,
    k: usize,
    n: usize,
    a: &[f32],
    a_strides: (usize, usize),
    b: &[f32],
    b_strides: (usize, usize),
    c: &mut [f32],
) {
    debug_assert_eq!(c.len(), rows * n);
    let a_offset = if k == 0 { 0 } else { first_row * a_strides.0 };
    // SAFETY: `gemm` asserted that every element addressed by the strides lies
    // within `a` and `b`, and `c` holds exactly `rows * n` contiguous elements.
    unsafe {
        matrixmultiply::sgemm(
            rows,
            k,
            n,
            1.0,
            a.as_ptr().add(a_offset),
            a_strides.0 as isize,
            a_strides.1 as isize,
            b.as_ptr(),
            b_strides.0 as isize,
            b_strides.1 as isize,
            0.0,
            c.as_mut_ptr(),
            n as isize,
            1,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemm() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut c = [0.0; 4];
        Device::Cpu.gemm(2, 3, 2, &a, (3, 1), &b, (2, 1), &mut c);
        assert_eq!(c, [22.0, 28.0, 49.0, 64.0]);
    }

    #[test]
    fn test_gemm_transposed() {
        // a^T where a is 3x2 stored row-major
        let a = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut c = [0.0; 4];
        Device::Cpu.gemm(2, 3, 2, &a, (1, 2), &b, (2, 1), &mut c);
        assert_eq!(c, [22.0, 28.0, 49.0, 64.0]);
    }

    #[test]
    fn test_parallel_matches_cpu() {
        let (m, k, n) = (7, 5, 3);
        let a = (0..m * k).map(|v| v as f32 * 0.5).collect::<Vec<_>>();
        let b = (0..k * n).map(|v| v as f32 - 4.0).collect::<Vec<_>>();
        let mut serial = vec![0.0; m * n];
        let mut parallel = vec![0.0; m * n];
        Device::Cpu.gemm(m, k, n, &a, (k, 1), &b, (n, 1), &mut serial);
        Device::Parallel { threads: 3 }.gemm(m, k, n, &a, (k, 1), &b, (n, 1), &mut parallel);
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_thread_pool_size() {
        assert_eq!(Device::Cpu.thread_pool().unwrap().current_num_threads(), 1);
        let pool = Device::with_threads(3).thread_pool().unwrap();
        assert_eq!(pool.current_num_threads(), 3);
        // parallel matrix products stay on the device's workers
        let (m, k, n) = (64, 4, 4);
        let a = vec![1.0; m * k];
        let b = vec![1.0; k * n];
        let mut c = vec![0.0; m * n];
        pool.install(|| {
            Device::with_threads(3).gemm(m, k, n, &a, (k, 1), &b, (n, 1), &mut c);
            assert_eq!(rayon::current_num_threads(), 3);
        });
        assert!(c.iter().all(|v| *v == 4.0));
    }

    #[test]
    fn test_device_selection() {
        assert_eq!(Device::with_threads(1), Device::Cpu);
        assert_eq!(Device::with_threads(0), Device::Cpu);
        assert_eq!(Device::with_threads(4), Device::Parallel { threads: 4 });
        assert_eq!(Device::with_threads(4).to_string(), "cpu (4 threads)");
        assert_eq!(Device::Cpu.to_string(), "cpu");
    }
}
