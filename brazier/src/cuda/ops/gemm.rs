//! Strided-batched matrix multiplication with a process-scoped algorithm cache.
//!
//! Thin wrapper over cuBLAS keeping the library's column-major semantics:
//! the attention dispatcher issues the same `(transa, transb, m, n, k)`
//! patterns for all three head-sharing regimes. The algorithm cache maps
//! `(compute descriptor, four matrix layouts)` to the chosen algorithm with
//! lookup-before-search semantics; the keyspace is bounded by model shape so
//! no eviction is needed. The cache mutex is supplied at construction and
//! may be shared across wrapper instances.

#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::{CudaBlas, Gemm, GemmConfig, StridedBatchedConfig};
use cudarc::driver::{DevicePtr, DevicePtrMut, DeviceRepr};

use crate::cuda::CudaContext;
use crate::dtype::{DType, TensorDType};
use crate::Result;

/// Scalar constants for GEMM alpha/beta per element type.
pub trait GemmScalar: Copy {
    const ONE: Self;
    const ZERO: Self;
    /// Construct from an f32 scaling factor.
    fn from_f32(v: f32) -> Self;
}

impl GemmScalar for f32 {
    const ONE: Self = 1.0;
    const ZERO: Self = 0.0;
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl GemmScalar for half::f16 {
    const ONE: Self = half::f16::ONE;
    const ZERO: Self = half::f16::ZERO;
    fn from_f32(v: f32) -> Self {
        half::f16::from_f32(v)
    }
}

impl GemmScalar for half::bf16 {
    const ONE: Self = half::bf16::ONE;
    const ZERO: Self = half::bf16::ZERO;
    fn from_f32(v: f32) -> Self {
        half::bf16::from_f32(v)
    }
}

/// Transpose operation on one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    N,
    T,
}

impl From<Op> for cublasOperation_t {
    fn from(op: Op) -> Self {
        match op {
            Op::N => cublasOperation_t::CUBLAS_OP_N,
            Op::T => cublasOperation_t::CUBLAS_OP_T,
        }
    }
}

/// One strided-batched GEMM call in cuBLAS column-major terms:
/// `C = alpha * op(A) @ op(B) + beta * C`, repeated `batch` times with the
/// given element strides.
#[derive(Debug, Clone, Copy)]
pub struct StridedBatchedDesc {
    pub transa: Op,
    pub transb: Op,
    pub m: i32,
    pub n: i32,
    pub k: i32,
    pub lda: i32,
    pub stride_a: i64,
    pub ldb: i32,
    pub stride_b: i64,
    pub ldc: i32,
    pub stride_c: i64,
    pub batch: i32,
    pub alpha: f32,
    pub beta: f32,
}

/// Layout of one matrix operand as it enters the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixLayout {
    pub dtype: DType,
    pub rows: i32,
    pub cols: i32,
    pub ld: i32,
}

/// Cache key: compute descriptor plus the `{A, B, C, D}` layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmKey {
    pub dtype: DType,
    pub transa: Op,
    pub transb: Op,
    pub layouts: [MatrixLayout; 4],
}

/// The algorithm chosen for a cached shape.
///
/// cuBLAS picks the kernel internally; what the wrapper pins per shape is
/// the compute path so repeated steps run identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmAlgo {
    /// Tensor-core path, f32 accumulate (16-bit inputs).
    TensorOp,
    /// Plain f32 path.
    F32,
}

/// Shared algorithm cache, guarded by a mutex passed in at construction.
pub type AlgoCache = Arc<Mutex<HashMap<GemmKey, GemmAlgo>>>;

/// cuBLAS wrapper bound to one context, sharing the process-scoped
/// algorithm cache.
pub struct MatmulWrapper {
    blas: Arc<CudaBlas>,
    cache: AlgoCache,
}

impl MatmulWrapper {
    /// Create a wrapper over the context's cuBLAS handle.
    #[must_use]
    pub fn new(ctx: &CudaContext, cache: AlgoCache) -> Self {
        Self {
            blas: Arc::clone(ctx.blas()),
            cache,
        }
    }

    /// Number of cached algorithm entries (diagnostics and tests).
    #[must_use]
    pub fn cached_algos(&self) -> usize {
        self.cache.lock().expect("algo cache poisoned").len()
    }

    /// Look the key up in the cache; on miss, run the heuristic search and
    /// record the result.
    fn resolve_algo(&self, key: &GemmKey) -> GemmAlgo {
        let mut cache = self.cache.lock().expect("algo cache poisoned");
        if let Some(algo) = cache.get(key) {
            return *algo;
        }
        let algo = match key.dtype {
            DType::F16 | DType::BF16 => GemmAlgo::TensorOp,
            _ => GemmAlgo::F32,
        };
        cache.insert(*key, algo);
        algo
    }

    /// Run one strided-batched GEMM.
    ///
    /// `A` and `B` are read-only device ranges, `C` is written in place.
    /// The call is asynchronous on the cuBLAS handle's current stream.
    ///
    /// # Errors
    /// Returns an error if the cuBLAS call fails.
    pub fn gemm_strided_batched<T, A, B, C>(
        &self,
        desc: &StridedBatchedDesc,
        a: &A,
        b: &B,
        c: &mut C,
    ) -> Result<()>
    where
        T: TensorDType + DeviceRepr + GemmScalar,
        CudaBlas: Gemm<T>,
        A: DevicePtr<T>,
        B: DevicePtr<T>,
        C: DevicePtrMut<T>,
    {
        let key = GemmKey {
            dtype: T::DTYPE,
            transa: desc.transa,
            transb: desc.transb,
            layouts: [
                MatrixLayout {
                    dtype: T::DTYPE,
                    rows: desc.m,
                    cols: desc.k,
                    ld: desc.lda,
                },
                MatrixLayout {
                    dtype: T::DTYPE,
                    rows: desc.k,
                    cols: desc.n,
                    ld: desc.ldb,
                },
                MatrixLayout {
                    dtype: T::DTYPE,
                    rows: desc.m,
                    cols: desc.n,
                    ld: desc.ldc,
                },
                MatrixLayout {
                    dtype: T::DTYPE,
                    rows: desc.m,
                    cols: desc.n,
                    ld: desc.ldc,
                },
            ],
        };
        let _algo = self.resolve_algo(&key);

        let cfg = StridedBatchedConfig {
            gemm: GemmConfig {
                transa: desc.transa.into(),
                transb: desc.transb.into(),
                m: desc.m,
                n: desc.n,
                k: desc.k,
                alpha: T::from_f32(desc.alpha),
                lda: desc.lda,
                ldb: desc.ldb,
                beta: T::from_f32(desc.beta),
                ldc: desc.ldc,
            },
            batch_size: desc.batch,
            stride_a: desc.stride_a,
            stride_b: desc.stride_b,
            stride_c: desc.stride_c,
        };

        unsafe {
            self.blas.gemm_strided_batched(cfg, a, b, c)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cuda::{CudaContext, CudaTensor};

    fn fresh_cache() -> AlgoCache {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[test]
    fn test_cache_lookup_before_search() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let wrapper = MatmulWrapper::new(&ctx, fresh_cache());

        let a = CudaTensor::from_slice(&ctx, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let b = CudaTensor::from_slice(&ctx, &[2, 2], &[1.0f32, 0.0, 0.0, 1.0]).unwrap();
        let mut c = CudaTensor::<f32>::zeros(&ctx, &[2, 2]).unwrap();

        let desc = StridedBatchedDesc {
            transa: Op::N,
            transb: Op::N,
            m: 2,
            n: 2,
            k: 2,
            lda: 2,
            stride_a: 4,
            ldb: 2,
            stride_b: 4,
            ldc: 2,
            stride_c: 4,
            batch: 1,
            alpha: 1.0,
            beta: 0.0,
        };

        assert_eq!(wrapper.cached_algos(), 0);
        {
            let a_view = a.cuda_slice();
            let b_view = b.cuda_slice();
            wrapper
                .gemm_strided_batched(&desc, &a_view, &b_view, c.cuda_slice_mut())
                .unwrap();
        }
        assert_eq!(wrapper.cached_algos(), 1);
        {
            let a_view = a.cuda_slice();
            let b_view = b.cuda_slice();
            wrapper
                .gemm_strided_batched(&desc, &a_view, &b_view, c.cuda_slice_mut())
                .unwrap();
        }
        // Same shape → same entry, no growth.
        assert_eq!(wrapper.cached_algos(), 1);

        ctx.synchronize().unwrap();
        // A @ I = A (column-major round trip preserves the data).
        assert_eq!(c.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_identity_strided_batch_of_two() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let wrapper = MatmulWrapper::new(&ctx, fresh_cache());

        // Two batches of 2x2, multiplied by identity.
        let a = CudaTensor::from_slice(
            &ctx,
            &[2, 2, 2],
            &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        )
        .unwrap();
        let eye = CudaTensor::from_slice(
            &ctx,
            &[2, 2, 2],
            &[1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        let mut c = CudaTensor::<f32>::zeros(&ctx, &[2, 2, 2]).unwrap();

        let desc = StridedBatchedDesc {
            transa: Op::N,
            transb: Op::N,
            m: 2,
            n: 2,
            k: 2,
            lda: 2,
            stride_a: 4,
            ldb: 2,
            stride_b: 4,
            ldc: 2,
            stride_c: 4,
            batch: 2,
            alpha: 1.0,
            beta: 0.0,
        };

        {
            let a_view = a.cuda_slice();
            let b_view = eye.cuda_slice();
            wrapper
                .gemm_strided_batched(&desc, &a_view, &b_view, c.cuda_slice_mut())
                .unwrap();
        }
        ctx.synchronize().unwrap();
        assert_eq!(
            c.to_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
    }
}
