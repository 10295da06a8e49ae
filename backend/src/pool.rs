//! A bounded free-list of fixed-width byte buffers.
//!
//! The UDP ingress reads every datagram into one of these to amortize
//! allocation. Purely an allocator: dropping a buffer instead of returning
//! it is always safe.

use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct Pool {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    width: usize,
}

impl Pool {
    /// A pool holding at most `max_size` recycled buffers of `width` bytes.
    pub fn new(max_size: usize, width: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_size);
        Self {
            tx,
            rx: Mutex::new(rx),
            width,
        }
    }

    /// A zeroed buffer of the pool width, recycled when one is available.
    pub fn get(&self) -> Vec<u8> {
        match self.rx.lock().try_recv() {
            Ok(buf) => buf,
            Err(_) => vec![0; self.width],
        }
    }

    /// A buffer of at least `size` bytes; allocates fresh when the recycled
    /// buffer is too small.
    pub fn get_by_size(&self, size: usize) -> Vec<u8> {
        match self.rx.lock().try_recv() {
            Ok(mut buf) if buf.capacity() >= size => {
                buf.resize(size, 0);
                buf
            }
            _ => vec![0; size],
        }
    }

    /// Return a buffer to the pool. Undersized buffers and overflow beyond
    /// the pool bound are discarded.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.width {
            return;
        }
        buf.resize(self.width, 0);
        let _ = self.tx.try_send(buf);
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_width_sized_buffers() {
        let pool = Pool::new(4, 2048);
        let buf = pool.get();
        assert_eq!(buf.len(), 2048);
    }

    #[test]
    fn put_then_get_recycles() {
        let pool = Pool::new(4, 64);
        let mut buf = pool.get();
        buf[0] = 7;
        pool.put(buf);
        // The recycled buffer comes back width-sized.
        let buf = pool.get();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn undersized_buffers_are_dropped() {
        let pool = Pool::new(4, 64);
        pool.put(vec![0; 8]);
        // Nothing recycled; a fresh buffer is allocated.
        assert_eq!(pool.get().len(), 64);
    }

    #[test]
    fn get_by_size_allocates_when_recycled_is_too_small() {
        let pool = Pool::new(4, 64);
        pool.put(vec![0; 64]);
        let big = pool.get_by_size(1024);
        assert_eq!(big.len(), 1024);

        pool.put(vec![0; 64]);
        let small = pool.get_by_size(16);
        assert_eq!(small.len(), 16);
    }

    #[test]
    fn overflow_is_discarded() {
        let pool = Pool::new(1, 8);
        pool.put(vec![0; 8]);
        // A second put exceeds the bound and must not block.
        pool.put(vec![0; 8]);
        assert_eq!(pool.get().len(), 8);
    }
}
