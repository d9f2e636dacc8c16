//! Rolling key/value cache with uniform addressing over paged or linear storage.
//!
//! The attention step dispatcher is instantiated per storage variant; this
//! module gives it a single addressing contract
//! `(sequence, kv, timestep, head, dim) → element address` regardless of
//! whether the cache is one contiguous block per layer or a pool of
//! fixed-size blocks indexed through per-sequence tables.
//!
//! Block bookkeeping is CPU-side only; the GPU sees a flat pool plus an
//! index table.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::cuda::stream::{default_stream, memset_d32_async};
use crate::cuda::{CudaContext, CudaTensor};
use crate::dtype::{CacheQuant, DType};
use crate::Result;

/// Per-token geometry of the cache, shared by both storage variants.
#[derive(Debug, Clone, Copy)]
pub struct CacheShape {
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Element size in bytes; 1 when the cache is quantised.
    pub elem_size: usize,
}

impl CacheShape {
    /// Build the shape from the activation dtype and quantisation mode.
    #[must_use]
    pub fn new(num_kv_heads: usize, head_dim: usize, dtype: DType, quant: CacheQuant) -> Self {
        Self {
            num_kv_heads,
            head_dim,
            elem_size: quant.element_size(dtype),
        }
    }

    /// Bytes occupied by one token's K (or V) vector.
    #[must_use]
    pub fn bytes_per_token(&self) -> usize {
        self.num_kv_heads * self.head_dim * self.elem_size
    }
}

/// Addressing view over one layer's K/V storage.
///
/// Exposes addressing only; ownership of the backing memory stays with the
/// [`KvCacheManager`]. All addresses are raw device pointers.
#[derive(Debug, Clone, Copy)]
pub enum KvCacheView {
    /// One contiguous `[batch, 2, max_seq, heads*dim]` block.
    Linear {
        /// Device address of the block.
        base: u64,
        max_seq: usize,
        shape: CacheShape,
    },
    /// Pool of fixed-size blocks indexed through a per-sequence table of
    /// shape `[batch, 2, max_blocks_per_seq]` (row 0 = K, row 1 = V).
    Paged {
        /// Device address of the block pool.
        pool: u64,
        /// Device address of the `i32` block-index table.
        block_table: u64,
        tokens_per_block: usize,
        max_blocks_per_seq: usize,
        shape: CacheShape,
    },
}

impl KvCacheView {
    /// Element size in bytes (1 when quantised).
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.shape().elem_size
    }

    /// Per-token geometry.
    #[must_use]
    pub fn shape(&self) -> CacheShape {
        match self {
            Self::Linear { shape, .. } | Self::Paged { shape, .. } => *shape,
        }
    }

    /// Maximum timestep the view can address.
    #[must_use]
    pub fn capacity(&self) -> usize {
        match self {
            Self::Linear { max_seq, .. } => *max_seq,
            Self::Paged {
                tokens_per_block,
                max_blocks_per_seq,
                ..
            } => tokens_per_block * max_blocks_per_seq,
        }
    }

    /// Host-side byte offset of `(sequence, kv, timestep, head, dim)` for the
    /// linear variant. The paged variant needs the block table contents and
    /// resolves addresses on the device; see `paged_block_offset`.
    ///
    /// # Panics
    /// Panics on the paged variant, or if `timestep >= capacity`.
    #[must_use]
    pub fn linear_offset(&self, seq: usize, kv: usize, timestep: usize, head: usize, dim: usize) -> usize {
        let Self::Linear { max_seq, shape, .. } = self else {
            panic!("linear_offset called on a paged view");
        };
        assert!(timestep < *max_seq, "timestep {timestep} >= capacity {max_seq}");
        let token = ((seq * 2 + kv) * max_seq + timestep) * shape.bytes_per_token();
        token + (head * shape.head_dim + dim) * shape.elem_size
    }

    /// Byte offset inside the paged pool for a resolved physical block,
    /// given the within-block position `timestep % tokens_per_block`.
    ///
    /// # Panics
    /// Panics on the linear variant.
    #[must_use]
    pub fn paged_block_offset(&self, block_idx: usize, timestep: usize, head: usize, dim: usize) -> usize {
        let Self::Paged {
            tokens_per_block,
            max_blocks_per_seq,
            shape,
            ..
        } = self
        else {
            panic!("paged_block_offset called on a linear view");
        };
        assert!(
            timestep < tokens_per_block * max_blocks_per_seq,
            "timestep {timestep} >= capacity {}",
            tokens_per_block * max_blocks_per_seq
        );
        let within = timestep % tokens_per_block;
        (block_idx * tokens_per_block + within) * shape.bytes_per_token()
            + (head * shape.head_dim + dim) * shape.elem_size
    }

    /// Scalar arguments for kernels, in the order every cache-touching
    /// kernel declares them: `(paged, base_or_pool, block_table,
    /// tokens_per_block, max_blocks_per_seq, max_seq)`.
    #[must_use]
    pub fn kernel_args(&self) -> (i32, u64, u64, i32, i32, i32) {
        match *self {
            Self::Linear { base, max_seq, .. } => (0, base, 0, 0, 0, max_seq as i32),
            Self::Paged {
                pool,
                block_table,
                tokens_per_block,
                max_blocks_per_seq,
                ..
            } => (
                1,
                pool,
                block_table,
                tokens_per_block as i32,
                max_blocks_per_seq as i32,
                (tokens_per_block * max_blocks_per_seq) as i32,
            ),
        }
    }
}

/// CPU-side free list for the paged pool. Allocation and free are O(1).
#[derive(Debug)]
pub struct BlockAllocator {
    free_blocks: Vec<usize>,
    num_blocks: usize,
}

impl BlockAllocator {
    /// Create a new allocator with all blocks free.
    ///
    /// # Panics
    /// Panics if `num_blocks` is zero.
    #[must_use]
    pub fn new(num_blocks: usize) -> Self {
        assert!(num_blocks > 0, "num_blocks must be > 0");
        Self {
            free_blocks: (0..num_blocks).rev().collect(),
            num_blocks,
        }
    }

    /// Allocate a single block, or `None` if the pool is exhausted.
    pub fn allocate(&mut self) -> Option<usize> {
        self.free_blocks.pop()
    }

    /// Free blocks back to the pool.
    ///
    /// # Panics
    /// Panics on an out-of-range index or double free.
    pub fn free_all(&mut self, blocks: &[usize]) {
        for &b in blocks {
            assert!(b < self.num_blocks, "block index {b} out of range");
            assert!(!self.free_blocks.contains(&b), "double-free of block {b}");
            self.free_blocks.push(b);
        }
    }

    /// Number of free blocks remaining.
    #[must_use]
    pub fn num_free(&self) -> usize {
        self.free_blocks.len()
    }

    /// Whether at least `n` blocks can be allocated.
    #[must_use]
    pub fn can_allocate(&self, n: usize) -> bool {
        self.free_blocks.len() >= n
    }
}

/// Backing storage for every layer's K/V cache, either linear or paged.
///
/// Single writer per sequence: only the slot driving a sequence touches its
/// rows / blocks.
pub struct KvCacheManager {
    ctx: CudaContext,
    shape: CacheShape,
    max_batch_size: usize,
    storage: Storage,
}

enum Storage {
    Linear {
        /// One `[batch, 2, max_seq, heads*dim]` byte block per layer.
        layers: Vec<CudaTensor<u8>>,
        max_seq: usize,
    },
    Paged {
        /// One block pool per layer, `[num_blocks, tokens_per_block, heads*dim]` bytes.
        layers: Vec<CudaTensor<u8>>,
        /// Device block-index table `[batch, 2, max_blocks_per_seq]`, shared by
        /// all layers (the same physical index is used in every layer's pool).
        table: CudaTensor<i32>,
        allocator: BlockAllocator,
        /// Host copy of each sequence's allocated blocks (K chain then V chain).
        seq_blocks: Vec<Vec<usize>>,
        tokens_per_block: usize,
        max_blocks_per_seq: usize,
    },
}

impl KvCacheManager {
    /// Allocate a linear cache: one contiguous block per layer.
    ///
    /// # Errors
    /// Returns an error if GPU allocation fails.
    pub fn linear(
        ctx: &CudaContext,
        num_layers: usize,
        max_batch_size: usize,
        max_seq: usize,
        shape: CacheShape,
    ) -> Result<Self> {
        let bytes = max_batch_size * 2 * max_seq * shape.bytes_per_token();
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            layers.push(CudaTensor::<u8>::zeros(ctx, &[bytes])?);
        }
        Ok(Self {
            ctx: ctx.clone(),
            shape,
            max_batch_size,
            storage: Storage::Linear { layers, max_seq },
        })
    }

    /// Allocate a paged cache: a pool of `num_blocks` blocks per layer plus
    /// the per-sequence index table.
    ///
    /// # Errors
    /// Returns an error if GPU allocation fails.
    pub fn paged(
        ctx: &CudaContext,
        num_layers: usize,
        max_batch_size: usize,
        tokens_per_block: usize,
        num_blocks: usize,
        max_blocks_per_seq: usize,
        shape: CacheShape,
    ) -> Result<Self> {
        let pool_bytes = num_blocks * tokens_per_block * shape.bytes_per_token();
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            layers.push(CudaTensor::<u8>::zeros(ctx, &[pool_bytes])?);
        }
        let table = CudaTensor::<i32>::zeros(ctx, &[max_batch_size, 2, max_blocks_per_seq])?;
        Ok(Self {
            ctx: ctx.clone(),
            shape,
            max_batch_size,
            storage: Storage::Paged {
                layers,
                table,
                allocator: BlockAllocator::new(num_blocks),
                seq_blocks: vec![Vec::new(); max_batch_size],
                tokens_per_block,
                max_blocks_per_seq,
            },
        })
    }

    /// Per-token geometry.
    #[must_use]
    pub fn cache_shape(&self) -> CacheShape {
        self.shape
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        match &self.storage {
            Storage::Linear { layers, .. } | Storage::Paged { layers, .. } => layers.len(),
        }
    }

    /// Maximum timestep any sequence can reach.
    #[must_use]
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Linear { max_seq, .. } => *max_seq,
            Storage::Paged {
                tokens_per_block,
                max_blocks_per_seq,
                ..
            } => tokens_per_block * max_blocks_per_seq,
        }
    }

    /// Reserve cache room for sequence `seq_idx` up to `total_len` tokens.
    ///
    /// Linear storage is pre-sized, so this only validates the length. Paged
    /// storage allocates K and V block chains and uploads the sequence's
    /// table row.
    ///
    /// # Errors
    /// Returns an error if the pool is exhausted or the upload fails.
    ///
    /// # Panics
    /// Panics if `seq_idx` is out of range.
    pub fn begin_sequence(&mut self, seq_idx: usize, total_len: usize) -> Result<()> {
        assert!(seq_idx < self.max_batch_size, "sequence index out of range");
        if total_len > self.capacity() {
            return Err(crate::Error::PreconditionViolation(format!(
                "sequence length {total_len} exceeds cache capacity {}",
                self.capacity()
            )));
        }
        match &mut self.storage {
            Storage::Linear { .. } => Ok(()),
            Storage::Paged {
                table,
                allocator,
                seq_blocks,
                tokens_per_block,
                max_blocks_per_seq,
                ..
            } => {
                // Re-arming a slot frees the previous request's blocks first.
                if !seq_blocks[seq_idx].is_empty() {
                    allocator.free_all(&seq_blocks[seq_idx]);
                    seq_blocks[seq_idx].clear();
                }

                let blocks_needed = total_len.div_ceil(*tokens_per_block);
                assert!(
                    blocks_needed <= *max_blocks_per_seq,
                    "sequence needs {blocks_needed} blocks, table holds {max_blocks_per_seq}"
                );
                if !allocator.can_allocate(2 * blocks_needed) {
                    return Err(crate::Error::PreconditionViolation(format!(
                        "paged pool exhausted: need {} blocks, {} free",
                        2 * blocks_needed,
                        allocator.num_free()
                    )));
                }

                let mut row = vec![0i32; 2 * *max_blocks_per_seq];
                for kv in 0..2 {
                    for j in 0..blocks_needed {
                        let b = allocator.allocate().expect("checked can_allocate");
                        seq_blocks[seq_idx].push(b);
                        row[kv * *max_blocks_per_seq + j] = b as i32;
                    }
                }

                // Upload the row at [seq_idx, :, :].
                let row_view = table.slice_view(
                    seq_idx * 2 * *max_blocks_per_seq,
                    &[2 * *max_blocks_per_seq],
                );
                let stream = default_stream(self.ctx.device());
                for (j, &v) in row.iter().enumerate() {
                    // Small table rows; one memset per entry keeps this on the
                    // stream without a staging buffer.
                    memset_d32_async(row_view.device_ptr_at(j), v as u32, 1, stream)?;
                }
                Ok(())
            }
        }
    }

    /// Release the blocks held by sequence `seq_idx` (paged only).
    ///
    /// # Panics
    /// Panics if `seq_idx` is out of range.
    pub fn end_sequence(&mut self, seq_idx: usize) {
        assert!(seq_idx < self.max_batch_size, "sequence index out of range");
        if let Storage::Paged {
            allocator,
            seq_blocks,
            ..
        } = &mut self.storage
        {
            allocator.free_all(&seq_blocks[seq_idx]);
            seq_blocks[seq_idx].clear();
        }
    }

    /// Addressing view over `layer`'s storage.
    ///
    /// # Panics
    /// Panics if `layer` is out of range.
    #[must_use]
    pub fn layer_view(&self, layer: usize) -> KvCacheView {
        match &self.storage {
            Storage::Linear { layers, max_seq } => KvCacheView::Linear {
                base: layers[layer].device_ptr(),
                max_seq: *max_seq,
                shape: self.shape,
            },
            Storage::Paged {
                layers,
                table,
                tokens_per_block,
                max_blocks_per_seq,
                ..
            } => KvCacheView::Paged {
                pool: layers[layer].device_ptr(),
                block_table: table.device_ptr(),
                tokens_per_block: *tokens_per_block,
                max_blocks_per_seq: *max_blocks_per_seq,
                shape: self.shape,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> CacheShape {
        CacheShape::new(4, 16, DType::F16, CacheQuant::None)
    }

    #[test]
    fn cache_shape_sizes() {
        let s = shape();
        assert_eq!(s.elem_size, 2);
        assert_eq!(s.bytes_per_token(), 4 * 16 * 2);

        let q = CacheShape::new(4, 16, DType::F16, CacheQuant::Int8);
        assert_eq!(q.elem_size, 1);
        assert_eq!(q.bytes_per_token(), 64);
    }

    #[test]
    fn linear_offset_formula() {
        let view = KvCacheView::Linear {
            base: 0,
            max_seq: 32,
            shape: shape(),
        };
        let bpt = shape().bytes_per_token();

        assert_eq!(view.linear_offset(0, 0, 0, 0, 0), 0);
        // V plane of sequence 0 starts max_seq tokens in.
        assert_eq!(view.linear_offset(0, 1, 0, 0, 0), 32 * bpt);
        // Sequence 1 starts 2*max_seq tokens in.
        assert_eq!(view.linear_offset(1, 0, 0, 0, 0), 2 * 32 * bpt);
        // Head/dim stride inside one token.
        assert_eq!(view.linear_offset(0, 0, 3, 2, 5), (3 * bpt) + (2 * 16 + 5) * 2);
        assert_eq!(view.capacity(), 32);
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn linear_offset_past_capacity_panics() {
        let view = KvCacheView::Linear {
            base: 0,
            max_seq: 8,
            shape: shape(),
        };
        let _ = view.linear_offset(0, 0, 8, 0, 0);
    }

    #[test]
    fn paged_offset_formula() {
        let view = KvCacheView::Paged {
            pool: 0,
            block_table: 0,
            tokens_per_block: 16,
            max_blocks_per_seq: 4,
            shape: shape(),
        };
        let bpt = shape().bytes_per_token();

        assert_eq!(view.capacity(), 64);
        // timestep 17 in physical block 9 lands at within-block offset 1.
        assert_eq!(view.paged_block_offset(9, 17, 0, 0), (9 * 16 + 1) * bpt);
        assert_eq!(
            view.paged_block_offset(0, 0, 1, 2),
            (16 + 2) * 2 // head stride 16 elems, elem 2 bytes
        );
    }

    #[test]
    fn kernel_args_shape() {
        let lin = KvCacheView::Linear {
            base: 0x1000,
            max_seq: 128,
            shape: shape(),
        };
        assert_eq!(lin.kernel_args(), (0, 0x1000, 0, 0, 0, 128));

        let paged = KvCacheView::Paged {
            pool: 0x2000,
            block_table: 0x3000,
            tokens_per_block: 32,
            max_blocks_per_seq: 8,
            shape: shape(),
        };
        assert_eq!(paged.kernel_args(), (1, 0x2000, 0x3000, 32, 8, 256));
    }

    #[test]
    fn allocator_exhaustion_and_reuse() {
        let mut alloc = BlockAllocator::new(2);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert!(alloc.allocate().is_none());
        assert_ne!(a, b);

        alloc.free_all(&[a]);
        assert_eq!(alloc.num_free(), 1);
        assert_eq!(alloc.allocate(), Some(a));
    }

    #[test]
    #[should_panic(expected = "double-free")]
    fn allocator_double_free_panics() {
        let mut alloc = BlockAllocator::new(2);
        let a = alloc.allocate().unwrap();
        alloc.free_all(&[a, a]);
    }

    mod gpu {
        use super::*;
        use crate::cuda::CudaContext;

        #[test]
        fn paged_manager_sequence_lifecycle() {
            let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
            let mut mgr =
                KvCacheManager::paged(&ctx, 2, 2, 16, 16, 4, shape()).expect("manager");

            assert_eq!(mgr.capacity(), 64);
            // 20 tokens → 2 blocks each for K and V.
            mgr.begin_sequence(0, 20).unwrap();
            mgr.begin_sequence(1, 20).unwrap();

            // Re-arming slot 0 frees its old blocks first.
            mgr.begin_sequence(0, 60).unwrap();

            mgr.end_sequence(0);
            mgr.end_sequence(1);

            let view = mgr.layer_view(1);
            assert!(matches!(view, KvCacheView::Paged { .. }));
        }

        #[test]
        fn linear_manager_capacity_check() {
            let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
            let mut mgr = KvCacheManager::linear(&ctx, 1, 2, 32, shape()).expect("manager");
            assert!(mgr.begin_sequence(0, 32).is_ok());
            assert!(mgr.begin_sequence(0, 33).is_err());
        }
    }
}
