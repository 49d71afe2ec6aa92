use crate::layout::MatrixRegion;
use crate::types::{BURST_BYTES, PcaError};
use memmap2::MmapMut;
use std::error::Error;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One transfer unit of a backing store.
pub type Burst = [u8; BURST_BYTES];

const ZERO_BURST: Burst = [0u8; BURST_BYTES];

// ========================================================================================
//                                  Backing stores
// ========================================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transfer of {count} bursts at burst {first} crosses the end of a {len}-burst store.")]
    OutOfRange {
        first: usize,
        count: usize,
        len: usize,
    },

    #[error("Store file '{path}' could not be prepared: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Flushing the store failed: {0}")]
    Flush(#[from] io::Error),
}

/// Burst-addressed storage that the streamed pipeline reads and writes.
pub trait BurstStore {
    type Error: Error + Send + Sync + 'static;

    fn len_bursts(&self) -> usize;

    fn read_bursts(&self, first: usize, out: &mut [Burst]) -> Result<(), Self::Error>;

    fn write_bursts(&mut self, first: usize, data: &[Burst]) -> Result<(), Self::Error>;

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

fn check_range(first: usize, count: usize, len: usize) -> Result<(), StoreError> {
    match first.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(StoreError::OutOfRange { first, count, len }),
    }
}

/// Store held entirely in process memory.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    bursts: Vec<Burst>,
}

impl MemoryStore {
    pub fn new(len_bursts: usize) -> Self {
        Self {
            bursts: vec![ZERO_BURST; len_bursts],
        }
    }
}

impl BurstStore for MemoryStore {
    type Error = StoreError;

    fn len_bursts(&self) -> usize {
        self.bursts.len()
    }

    fn read_bursts(&self, first: usize, out: &mut [Burst]) -> Result<(), StoreError> {
        check_range(first, out.len(), self.bursts.len())?;
        out.copy_from_slice(&self.bursts[first..first + out.len()]);
        Ok(())
    }

    fn write_bursts(&mut self, first: usize, data: &[Burst]) -> Result<(), StoreError> {
        check_range(first, data.len(), self.bursts.len())?;
        self.bursts[first..first + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Store backed by a memory-mapped scratch file, for working sets larger than RAM.
#[derive(Debug)]
pub struct MmapStore {
    map: MmapMut,
    len_bursts: usize,
}

impl MmapStore {
    /// Creates (or truncates) `path` and maps `capacity_bytes` rounded up to whole bursts.
    pub fn create(path: &Path, capacity_bytes: u64) -> Result<Self, StoreError> {
        let file_error = |source: io::Error| StoreError::File {
            path: path.to_path_buf(),
            source,
        };
        let len_bursts = usize::try_from(capacity_bytes.div_ceil(BURST_BYTES as u64))
            .map_err(|_| {
                file_error(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "capacity does not fit in the address space",
                ))
            })?;
        if len_bursts == 0 {
            return Err(file_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty store",
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(file_error)?;
        file.set_len((len_bursts * BURST_BYTES) as u64)
            .map_err(file_error)?;
        // SAFETY: the file was just created by this process and is not shared.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(file_error)?;
        Ok(Self { map, len_bursts })
    }
}

impl BurstStore for MmapStore {
    type Error = StoreError;

    fn len_bursts(&self) -> usize {
        self.len_bursts
    }

    fn read_bursts(&self, first: usize, out: &mut [Burst]) -> Result<(), StoreError> {
        check_range(first, out.len(), self.len_bursts)?;
        let bytes = &self.map[first * BURST_BYTES..(first + out.len()) * BURST_BYTES];
        for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(BURST_BYTES)) {
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    fn write_bursts(&mut self, first: usize, data: &[Burst]) -> Result<(), StoreError> {
        check_range(first, data.len(), self.len_bursts)?;
        let bytes = &mut self.map[first * BURST_BYTES..(first + data.len()) * BURST_BYTES];
        for (dst, src) in bytes.chunks_exact_mut(BURST_BYTES).zip(data) {
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.map.flush()?;
        Ok(())
    }
}

// ========================================================================================
//                                  Element packing
// ========================================================================================

/// Scalar types that can be packed into bursts as little-endian bytes.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const BYTES: usize;

    fn store_le(self, out: &mut [u8]);

    fn load_le(bytes: &[u8]) -> Self;
}

impl Element for u8 {
    const BYTES: usize = 1;

    fn store_le(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn load_le(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl Element for u32 {
    const BYTES: usize = 4;

    fn store_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn load_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        u32::from_le_bytes(raw)
    }
}

impl Element for f64 {
    const BYTES: usize = 8;

    fn store_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn load_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_le_bytes(raw)
    }
}

pub fn elements_per_burst<T: Element>() -> usize {
    BURST_BYTES / T::BYTES
}

/// Bursts needed to hold `width` elements of `T`.
pub fn bursts_per_row<T: Element>(width: usize) -> usize {
    width.div_ceil(elements_per_burst::<T>())
}

fn pack<T: Element>(values: &[T], bursts: &mut [Burst]) {
    let per_burst = elements_per_burst::<T>();
    for burst in bursts.iter_mut() {
        burst.fill(0);
    }
    for (chunk, burst) in values.chunks(per_burst).zip(bursts.iter_mut()) {
        for (value, slot) in chunk.iter().zip(burst.chunks_exact_mut(T::BYTES)) {
            value.store_le(slot);
        }
    }
}

fn unpack<T: Element>(bursts: &[Burst], values: &mut [T]) {
    let per_burst = elements_per_burst::<T>();
    for (chunk, burst) in values.chunks_mut(per_burst).zip(bursts) {
        for (value, slot) in chunk.iter_mut().zip(burst.chunks_exact(T::BYTES)) {
            *value = T::load_le(slot);
        }
    }
}

// ========================================================================================
//                                    Row streamer
// ========================================================================================

/// Moves whole rows and single column groups between typed buffers and a burst store.
pub struct RowStreamer<'a, S: BurstStore> {
    store: &'a mut S,
    scratch: Vec<Burst>,
    transferred: u64,
}

impl<'a, S: BurstStore> RowStreamer<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self {
            store,
            scratch: Vec::new(),
            transferred: 0,
        }
    }

    /// Total bursts read or written through this streamer.
    pub fn bursts_transferred(&self) -> u64 {
        self.transferred
    }

    pub fn flush(&mut self) -> Result<(), PcaError> {
        self.store.flush().map_err(PcaError::store)
    }

    /// Reads `burst_count` bursts starting at `*cursor` into `row` and advances the cursor.
    pub fn read_row<T: Element>(
        &mut self,
        cursor: &mut usize,
        burst_count: usize,
        row: &mut [T],
    ) -> Result<(), PcaError> {
        check_width::<T>(row.len(), burst_count)?;
        self.scratch.resize(burst_count, ZERO_BURST);
        self.store
            .read_bursts(*cursor, &mut self.scratch[..burst_count])
            .map_err(PcaError::store)?;
        unpack(&self.scratch[..burst_count], row);
        *cursor += burst_count;
        self.transferred += burst_count as u64;
        Ok(())
    }

    /// Writes `row` as `burst_count` bursts starting at `*cursor`, zero-padding the tail.
    pub fn write_row<T: Element>(
        &mut self,
        cursor: &mut usize,
        burst_count: usize,
        row: &[T],
    ) -> Result<(), PcaError> {
        check_width::<T>(row.len(), burst_count)?;
        self.scratch.resize(burst_count, ZERO_BURST);
        pack(row, &mut self.scratch[..burst_count]);
        self.store
            .write_bursts(*cursor, &self.scratch[..burst_count])
            .map_err(PcaError::store)?;
        *cursor += burst_count;
        self.transferred += burst_count as u64;
        Ok(())
    }

    pub fn read_row_at<T: Element>(
        &mut self,
        region: &MatrixRegion,
        row_index: usize,
        row: &mut [T],
    ) -> Result<(), PcaError> {
        let mut cursor = region.row_offset(row_index);
        self.read_row(&mut cursor, region.bursts_per_row, row)
    }

    pub fn write_row_at<T: Element>(
        &mut self,
        region: &MatrixRegion,
        row_index: usize,
        row: &[T],
    ) -> Result<(), PcaError> {
        let mut cursor = region.row_offset(row_index);
        self.write_row(&mut cursor, region.bursts_per_row, row)
    }

    /// Reads the single burst holding column group `group` of one row.
    pub fn read_chunk<T: Element>(
        &mut self,
        region: &MatrixRegion,
        row_index: usize,
        group: usize,
        chunk: &mut [T],
    ) -> Result<(), PcaError> {
        let mut cursor = region.row_offset(row_index) + group;
        self.read_row(&mut cursor, 1, chunk)
    }

    pub fn write_chunk<T: Element>(
        &mut self,
        region: &MatrixRegion,
        row_index: usize,
        group: usize,
        chunk: &[T],
    ) -> Result<(), PcaError> {
        let mut cursor = region.row_offset(row_index) + group;
        self.write_row(&mut cursor, 1, chunk)
    }
}

fn check_width<T: Element>(width: usize, burst_count: usize) -> Result<(), PcaError> {
    let capacity = burst_count * elements_per_burst::<T>();
    if width > capacity {
        return Err(PcaError::InvalidDimension(format!(
            "row of {width} elements does not fit in {burst_count} bursts ({capacity} elements)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_counts_round_up() {
        assert_eq!(bursts_per_row::<u8>(64), 1);
        assert_eq!(bursts_per_row::<u8>(65), 2);
        assert_eq!(bursts_per_row::<f64>(8), 1);
        assert_eq!(bursts_per_row::<f64>(9), 2);
        assert_eq!(bursts_per_row::<u32>(0), 0);
    }

    #[test]
    fn f64_row_round_trips_bit_for_bit() {
        let mut store = MemoryStore::new(16);
        let mut streamer = RowStreamer::new(&mut store);
        let row: Vec<f64> = vec![
            1.5,
            -0.0,
            f64::MIN_POSITIVE,
            1e300,
            -3.25,
            f64::NAN,
            7.0,
            8.0,
            9.0,
            std::f64::consts::PI,
        ];
        let burst_count = bursts_per_row::<f64>(row.len());
        let mut cursor = 3;
        streamer.write_row(&mut cursor, burst_count, &row).unwrap();
        assert_eq!(cursor, 3 + burst_count);

        let mut back = vec![0.0f64; row.len()];
        let mut cursor = 3;
        streamer.read_row(&mut cursor, burst_count, &mut back).unwrap();
        for (idx, (a, b)) in row.iter().zip(&back).enumerate() {
            assert_eq!(a.to_bits(), b.to_bits(), "mismatch at element {idx}");
        }
        assert_eq!(streamer.bursts_transferred(), 2 * burst_count as u64);
    }

    #[test]
    fn padding_is_written_as_zero() {
        let mut store = MemoryStore::new(2);
        {
            let mut streamer = RowStreamer::new(&mut store);
            let mut cursor = 0;
            streamer
                .write_row(&mut cursor, 2, &[u8::MAX; 70])
                .unwrap();
        }
        let mut raw = [ZERO_BURST; 2];
        store.read_bursts(0, &mut raw).unwrap();
        assert!(raw[0].iter().all(|&b| b == u8::MAX));
        assert!(raw[1][..6].iter().all(|&b| b == u8::MAX));
        assert!(raw[1][6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn u32_values_are_little_endian() {
        let mut store = MemoryStore::new(1);
        {
            let mut streamer = RowStreamer::new(&mut store);
            let mut cursor = 0;
            streamer
                .write_row(&mut cursor, 1, &[0x0102_0304u32])
                .unwrap();
        }
        let mut raw = [ZERO_BURST; 1];
        store.read_bursts(0, &mut raw).unwrap();
        assert_eq!(&raw[0][..4], &[4, 3, 2, 1]);
    }

    #[test]
    fn transfers_past_the_end_fail() {
        let mut store = MemoryStore::new(2);
        let mut streamer = RowStreamer::new(&mut store);
        let mut cursor = 1;
        let err = streamer
            .write_row(&mut cursor, 2, &[0.0f64; 16])
            .unwrap_err();
        assert!(matches!(err, PcaError::Store(_)), "unexpected error: {err}");
        assert_eq!(cursor, 1, "cursor must not move on failure");
    }

    #[test]
    fn rows_wider_than_their_bursts_are_rejected() {
        let mut store = MemoryStore::new(4);
        let mut streamer = RowStreamer::new(&mut store);
        let mut cursor = 0;
        let err = streamer
            .write_row(&mut cursor, 1, &[0.0f64; 9])
            .unwrap_err();
        assert!(matches!(err, PcaError::InvalidDimension(_)));
    }

    #[test]
    fn chunks_address_single_column_groups() {
        let region = MatrixRegion::new::<f64>(2, 3, 20);
        let mut store = MemoryStore::new(region.end());
        let mut streamer = RowStreamer::new(&mut store);
        let row: Vec<f64> = (0..20).map(|v| v as f64).collect();
        streamer.write_row_at(&region, 1, &row).unwrap();

        let mut chunk = [0.0f64; 8];
        streamer.read_chunk(&region, 1, 2, &mut chunk).unwrap();
        assert_eq!(&chunk[..4], &[16.0, 17.0, 18.0, 19.0]);
        assert!(chunk[4..].iter().all(|&v| v == 0.0));

        chunk[0] = -1.0;
        streamer.write_chunk(&region, 1, 2, &chunk).unwrap();
        let mut back = vec![0.0f64; 20];
        streamer.read_row_at(&region, 1, &mut back).unwrap();
        assert_eq!(back[16], -1.0);
        assert_eq!(back[15], 15.0);
    }

    #[test]
    fn mmap_store_round_trips_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.bin");
        let mut store = MmapStore::create(&path, 200).unwrap();
        assert_eq!(store.len_bursts(), 4);
        {
            let mut streamer = RowStreamer::new(&mut store);
            let mut cursor = 1;
            let row: Vec<u8> = (0..100).map(|v| v as u8).collect();
            streamer.write_row(&mut cursor, 2, &row).unwrap();
            streamer.flush().unwrap();

            let mut back = vec![0u8; 100];
            let mut cursor = 1;
            streamer.read_row(&mut cursor, 2, &mut back).unwrap();
            assert_eq!(back, row);
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 256);
    }

    #[test]
    fn mmap_store_rejects_zero_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let err = MmapStore::create(&dir.path().join("empty.bin"), 0).unwrap_err();
        assert!(matches!(err, StoreError::File { .. }));
    }
}
