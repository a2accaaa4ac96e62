//! Startup-allocated buffer pool
//!
//! Every multi-stage buffer lives here, allocated once and addressed by
//! (frame slot, symbol, ...) indices. Each buffer row has exactly one
//! writing stage; downstream stages read it only after the producing
//! stage's counter has closed, which is what makes the raw shared access
//! sound. Rows are handed out as slices, never owned.

use num_complex::Complex32;
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::config::Config;
use crate::FRAME_WND;

/// A fixed 2-D buffer shared across threads under the single-writer
/// discipline enforced by the scheduler's dependency graph.
pub struct Grid<T> {
    data: UnsafeCell<Box<[T]>>,
    rows: usize,
    cols: usize,
}

// Rows are disjoint and each row has a single writer at a time; the
// scheduler orders writers before readers via counter closure events.
unsafe impl<T: Send> Sync for Grid<T> {}

impl<T: Clone + Default> Grid<T> {
    pub fn new(rows: usize, cols: usize) -> Grid<T> {
        Grid {
            data: UnsafeCell::new(vec![T::default(); rows * cols].into_boxed_slice()),
            rows,
            cols,
        }
    }
}

impl<T> Grid<T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// # Safety
    ///
    /// The caller must be the row's unique writer: the task kind that owns
    /// this stage's buffer, running while the stage's counter is open.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut(&self, row: usize) -> &mut [T] {
        debug_assert!(row < self.rows);
        let data = &mut *self.data.get();
        &mut data[row * self.cols..(row + 1) * self.cols]
    }

    /// # Safety
    ///
    /// The row's producing stage must have closed (no live writer).
    pub unsafe fn row(&self, row: usize) -> &[T] {
        debug_assert!(row < self.rows);
        let data = &*self.data.get();
        &data[row * self.cols..(row + 1) * self.cols]
    }

    fn cell_ptr(&self, row: usize, col: usize) -> *mut T {
        debug_assert!(row < self.rows && col < self.cols);
        unsafe { (*self.data.get()).as_mut_ptr().add(row * self.cols + col) }
    }

    /// Single-element store through a raw pointer, for stages whose tasks
    /// write disjoint strides of a shared row concurrently.
    ///
    /// # Safety
    ///
    /// No other task may write this element while the stage is open, and
    /// readers wait for the stage's counter closure.
    pub unsafe fn write_at(&self, row: usize, col: usize, value: T) {
        self.cell_ptr(row, col).write(value);
    }
}

impl<T: Copy> Grid<T> {
    /// Contiguous store through a raw pointer; same discipline as
    /// [`Grid::write_at`] over `[col, col + src.len())`.
    ///
    /// # Safety
    ///
    /// The range must be disjoint from every other live writer's range.
    pub unsafe fn write_slice_at(&self, row: usize, col: usize, src: &[T]) {
        debug_assert!(col + src.len() <= self.cols);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.cell_ptr(row, col), src.len());
    }

    /// Borrow a sub-range of a row.
    ///
    /// # Safety
    ///
    /// The range must be disjoint from every live writer's range for the
    /// lifetime of the borrow.
    pub unsafe fn read_slice_at(&self, row: usize, col: usize, len: usize) -> &[T] {
        debug_assert!(col + len <= self.cols);
        std::slice::from_raw_parts(self.cell_ptr(row, col), len)
    }
}

/// One received packet: parsed wire header plus its I/Q payload.
#[derive(Debug)]
pub struct RxPacket {
    pub frame_id: u32,
    pub symbol_id: u32,
    pub cell_id: u32,
    pub ant_id: u32,
    pub iq: Box<[i16]>,
}

struct RxSlot {
    used: AtomicBool,
    pkt: UnsafeCell<RxPacket>,
}

/// Preallocated packet ring owned by one streamer thread.
///
/// The owning streamer is the only allocator and writer; the slot index
/// travels through the fabric, and the queue transfer orders the write
/// before master and worker reads. The `used` flag only recycles slots
/// after the FFT stage releases them.
pub struct RxRing {
    slots: Vec<RxSlot>,
    cursor: AtomicUsize,
}

unsafe impl Sync for RxRing {}

impl RxRing {
    pub fn new(num_slots: usize, samps_per_symbol: usize) -> RxRing {
        let slots = (0..num_slots)
            .map(|_| RxSlot {
                used: AtomicBool::new(false),
                pkt: UnsafeCell::new(RxPacket {
                    frame_id: 0,
                    symbol_id: 0,
                    cell_id: 0,
                    ant_id: 0,
                    iq: vec![0i16; samps_per_symbol * 2].into_boxed_slice(),
                }),
            })
            .collect();
        RxRing {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot. Called only by the ring's owning streamer thread.
    pub fn try_alloc(&self) -> Option<usize> {
        let start = self.cursor.load(Ordering::Relaxed);
        for i in 0..self.slots.len() {
            let idx = (start + i) % self.slots.len();
            if !self.slots[idx].used.load(Ordering::Acquire) {
                self.slots[idx].used.store(true, Ordering::Relaxed);
                self.cursor.store(idx + 1, Ordering::Relaxed);
                return Some(idx);
            }
        }
        None
    }

    /// # Safety
    ///
    /// Only the owning streamer thread, between `try_alloc` and publishing
    /// the slot's event.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn packet_mut(&self, slot: usize) -> &mut RxPacket {
        &mut *self.slots[slot].pkt.get()
    }

    /// # Safety
    ///
    /// The slot must have been published (its event dequeued) and not yet
    /// freed.
    pub unsafe fn packet(&self, slot: usize) -> &RxPacket {
        &*self.slots[slot].pkt.get()
    }

    /// Release a slot for reuse once its FFT has consumed the payload.
    pub fn free(&self, slot: usize) {
        self.slots[slot].used.store(false, Ordering::Release);
    }
}

/// All pipeline buffers, with the index arithmetic in one place.
pub struct BufferPool {
    /// Channel state, written by pilot FFT. Row (slot, user, antenna);
    /// one data subcarrier per column.
    pub csi: Grid<Complex32>,
    /// Uplink detector, written by beam. Row (slot, subcarrier); layout
    /// stream-major, `[stream * bs_ant + ant]`.
    pub ul_beam: Grid<Complex32>,
    /// Downlink precoder, written by beam. Row (slot, subcarrier); layout
    /// antenna-major, `[ant * streams + stream]`.
    pub dl_beam: Grid<Complex32>,
    /// Frequency-domain uplink data, written by FFT. Row (slot, UL symbol,
    /// antenna); one data subcarrier per column.
    pub fft_data: Grid<Complex32>,
    /// Equalized streams, written by demul. Row (slot, UL symbol); layout
    /// `[sc * streams + stream]`.
    pub equal: Grid<Complex32>,
    /// Soft demodulator output, written by demul. Row (slot, UL symbol,
    /// stream); one LLR byte per coded bit.
    pub demod: Grid<i8>,
    /// Decoded payload, written by decode. Row (slot, UL symbol, stream).
    pub decoded: Grid<u8>,
    /// Downlink constellation indices, written by encode. Row (slot, DL
    /// symbol, stream); one point index byte per subcarrier.
    pub dl_mod: Grid<u8>,
    /// Downlink frequency grid, written by precode. Row (slot, DL symbol,
    /// antenna); full FFT width.
    pub dl_ifft: Grid<Complex32>,
    /// Time-domain TX samples, written by IFFT and broadcast. Row (slot,
    /// DL TX symbol, antenna); interleaved i16 I/Q.
    pub dl_socket: Grid<i16>,
    /// Downlink MAC payload, written by the MAC (or prefilled when the MAC
    /// is disabled). Row (user); `[slot * mac_bytes_per_frame ..]`.
    pub dl_bits: Grid<u8>,
    /// One packet ring per streamer thread.
    pub rx_rings: Vec<RxRing>,

    bs_ant_num: usize,
    streams: usize,
    ofdm_data: usize,
    num_ul_syms: usize,
    num_dl_syms: usize,
    num_dl_tx_syms: usize,
    mac_bytes_per_frame: usize,
}

impl BufferPool {
    pub fn new(cfg: &Config) -> BufferPool {
        let frame = cfg.frame();
        let bs = cfg.bs_ant_num;
        let streams = cfg.spatial_streams();
        let ul = frame.num_ul_syms();
        let dl = frame.num_dl_syms();
        let dl_tx = frame.num_dl_tx_syms();
        let sc = cfg.ofdm_data_num;
        let samps = cfg.samps_per_symbol();

        let ring_slots = bs * FRAME_WND * frame.num_total_syms().max(1);

        let mut pool = BufferPool {
            csi: Grid::new(FRAME_WND * streams * bs, sc),
            ul_beam: Grid::new(FRAME_WND * sc, streams * bs),
            dl_beam: Grid::new(FRAME_WND * sc, bs * streams),
            fft_data: Grid::new(FRAME_WND * ul.max(1) * bs, sc),
            equal: Grid::new(FRAME_WND * ul.max(1), sc * streams),
            demod: Grid::new(
                FRAME_WND * ul.max(1) * streams,
                sc * cfg.mcs(false).mod_bits(),
            ),
            decoded: Grid::new(
                FRAME_WND * ul.max(1) * streams,
                cfg.data_bytes_per_symbol(false),
            ),
            dl_mod: Grid::new(FRAME_WND * dl.max(1) * streams, sc),
            dl_ifft: Grid::new(FRAME_WND * dl.max(1) * bs, cfg.fft_size),
            dl_socket: Grid::new(FRAME_WND * dl_tx.max(1) * bs, samps * 2),
            dl_bits: Grid::new(streams, FRAME_WND * cfg.mac_bytes_per_frame().max(1)),
            rx_rings: (0..cfg.socket_thread_num)
                .map(|_| RxRing::new(ring_slots, samps))
                .collect(),
            bs_ant_num: bs,
            streams,
            ofdm_data: sc,
            num_ul_syms: ul.max(1),
            num_dl_syms: dl.max(1),
            num_dl_tx_syms: dl_tx.max(1),
            mac_bytes_per_frame: cfg.mac_bytes_per_frame().max(1),
        };

        if !cfg.enable_mac && dl > 0 {
            pool.prefill_dl_bits();
        }
        pool
    }

    /// Deterministic downlink payload used when no MAC is attached.
    fn prefill_dl_bits(&mut self) {
        for ue in 0..self.streams {
            // exclusive access: called before any thread starts
            let row = unsafe { self.dl_bits.row_mut(ue) };
            let mut state = 0xace1_u32 ^ (ue as u32);
            for b in row.iter_mut() {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                *b = state as u8;
            }
        }
    }

    pub fn slot(frame: u64) -> usize {
        (frame % FRAME_WND as u64) as usize
    }

    pub fn csi_row(&self, frame: u64, ue: usize, ant: usize) -> usize {
        (Self::slot(frame) * self.streams + ue) * self.bs_ant_num + ant
    }

    pub fn beam_row(&self, frame: u64, sc: usize) -> usize {
        Self::slot(frame) * self.ofdm_data + sc
    }

    pub fn fft_row(&self, frame: u64, ul_symbol_idx: usize, ant: usize) -> usize {
        (Self::slot(frame) * self.num_ul_syms + ul_symbol_idx) * self.bs_ant_num + ant
    }

    pub fn equal_row(&self, frame: u64, ul_symbol_idx: usize) -> usize {
        Self::slot(frame) * self.num_ul_syms + ul_symbol_idx
    }

    pub fn demod_row(&self, frame: u64, ul_symbol_idx: usize, stream: usize) -> usize {
        (Self::slot(frame) * self.num_ul_syms + ul_symbol_idx) * self.streams + stream
    }

    pub fn decoded_row(&self, frame: u64, ul_symbol_idx: usize, stream: usize) -> usize {
        self.demod_row(frame, ul_symbol_idx, stream)
    }

    pub fn dl_mod_row(&self, frame: u64, dl_symbol_idx: usize, stream: usize) -> usize {
        (Self::slot(frame) * self.num_dl_syms + dl_symbol_idx) * self.streams + stream
    }

    pub fn dl_ifft_row(&self, frame: u64, dl_symbol_idx: usize, ant: usize) -> usize {
        (Self::slot(frame) * self.num_dl_syms + dl_symbol_idx) * self.bs_ant_num + ant
    }

    pub fn dl_socket_row(&self, frame: u64, dl_tx_symbol_idx: usize, ant: usize) -> usize {
        (Self::slot(frame) * self.num_dl_tx_syms + dl_tx_symbol_idx) * self.bs_ant_num + ant
    }

    /// Byte offset of a frame's payload in a user's `dl_bits` row.
    pub fn dl_bits_offset(&self, frame: u64) -> usize {
        Self::slot(frame) * self.mac_bytes_per_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_ring_recycles_slots() {
        let ring = RxRing::new(2, 4);
        let a = ring.try_alloc().unwrap();
        let b = ring.try_alloc().unwrap();
        assert_ne!(a, b);
        assert!(ring.try_alloc().is_none());
        ring.free(a);
        assert_eq!(ring.try_alloc().unwrap(), a);
    }

    #[test]
    fn grid_rows_are_disjoint() {
        let g: Grid<u32> = Grid::new(3, 4);
        unsafe {
            g.row_mut(0).fill(7);
            g.row_mut(2).fill(9);
            assert_eq!(g.row(0), &[7, 7, 7, 7]);
            assert_eq!(g.row(1), &[0, 0, 0, 0]);
            assert_eq!(g.row(2), &[9, 9, 9, 9]);
        }
    }

    #[test]
    fn row_indexing_uses_frame_slot() {
        let mut cfg = Config::default();
        cfg.bs_ant_num = 2;
        cfg.ue_ant_num = 2;
        cfg.frame_schedule = "PPUUDD".into();
        cfg.fft_size = 64;
        cfg.ofdm_data_num = 48;
        cfg.cb_bytes = 8;
        cfg.socket_thread_num = 1;
        cfg.finalize().unwrap();
        let pool = BufferPool::new(&cfg);
        assert_eq!(pool.fft_row(0, 1, 0), 2);
        assert_eq!(pool.fft_row(FRAME_WND as u64, 1, 0), 2);
        assert_eq!(pool.fft_row(1, 0, 1), (2 + 0) * 2 + 1);
        assert_eq!(pool.demod_row(1, 1, 1), (2 + 1) * 2 + 1);
        assert_eq!(pool.dl_socket_row(0, 1, 1), 3);
    }
}
