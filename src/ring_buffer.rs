//! A single-producer/single-consumer ring of interleaved `f32` samples.
//!
//! Backed by a flat `Vec<f32>` of fixed capacity with two monotonic
//! cursors (total frames written, total frames read); the physical index
//! into the backing store is always `cursor % capacity`. Wraparound is
//! handled by splitting each copy into at most two contiguous segments,
//! never sample-by-sample.

use std::sync::{Condvar, Mutex};

use crate::error::RingBufferError;

/// Blocking behavior for [`RingBuffer::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Wait until the whole slice fits, then copy it in one shot.
    Block,
    /// Copy as much as currently fits, wait, and repeat until all of the
    /// input has been written. For writes larger than the buffer itself.
    Incremental,
    /// Copy only if the whole slice fits right now; otherwise do nothing
    /// and report that the call would have blocked.
    Nowait,
}

/// Blocking behavior for [`RingBuffer::get_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Wait until enough unread frames exist, then copy them.
    Block,
    /// Fill `out` completely if enough data exists right now; otherwise
    /// do nothing and report that the call would have blocked.
    Nowait,
}

struct Inner {
    data: Vec<f32>,
    write_cursor: u64,
    read_cursor: u64,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn available_to_read(&self) -> u64 {
        self.write_cursor - self.read_cursor
    }

    fn available_to_write(&self) -> u64 {
        self.capacity() as u64 - self.available_to_read()
    }

    fn write_at(&mut self, data: &[f32]) {
        let cap = self.capacity();
        let start = (self.write_cursor as usize) % cap;
        let first_len = data.len().min(cap - start);
        self.data[start..start + first_len].copy_from_slice(&data[..first_len]);
        if first_len < data.len() {
            let rest = &data[first_len..];
            self.data[..rest.len()].copy_from_slice(rest);
        }
        self.write_cursor += data.len() as u64;
    }

    fn read_into(&mut self, out: &mut [f32]) {
        let cap = self.capacity();
        let start = (self.read_cursor as usize) % cap;
        let first_len = out.len().min(cap - start);
        out[..first_len].copy_from_slice(&self.data[start..start + first_len]);
        if first_len < out.len() {
            let rest_len = out.len() - first_len;
            out[first_len..].copy_from_slice(&self.data[..rest_len]);
        }
        self.read_cursor += out.len() as u64;
    }
}

/// A fixed-capacity SPSC ring buffer of `f32` samples.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    space_available: Condvar,
    data_available: Condvar,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity_frames: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![0.0; capacity_frames],
                write_cursor: 0,
                read_cursor: 0,
            }),
            space_available: Condvar::new(),
            data_available: Condvar::new(),
            capacity: capacity_frames,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently held in the buffer, unread.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("ring buffer lock poisoned");
        inner.available_to_read() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put(&self, data: &[f32], mode: PutMode) -> Result<(), RingBufferError> {
        if data.len() > self.capacity {
            return Err(RingBufferError::ExceedsCapacity {
                len: data.len(),
                capacity: self.capacity,
            });
        }

        match mode {
            PutMode::Nowait => {
                let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
                if inner.available_to_write() < data.len() as u64 {
                    return Err(RingBufferError::WouldBlock);
                }
                inner.write_at(data);
                drop(inner);
                self.data_available.notify_all();
                Ok(())
            }
            PutMode::Block => {
                let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
                while inner.available_to_write() < data.len() as u64 {
                    inner = self
                        .space_available
                        .wait(inner)
                        .expect("ring buffer lock poisoned");
                }
                inner.write_at(data);
                drop(inner);
                self.data_available.notify_all();
                Ok(())
            }
            PutMode::Incremental => {
                let mut offset = 0;
                while offset < data.len() {
                    let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
                    while inner.available_to_write() == 0 {
                        inner = self
                            .space_available
                            .wait(inner)
                            .expect("ring buffer lock poisoned");
                    }
                    let chunk_len =
                        (inner.available_to_write() as usize).min(data.len() - offset);
                    inner.write_at(&data[offset..offset + chunk_len]);
                    offset += chunk_len;
                    drop(inner);
                    self.data_available.notify_all();
                }
                Ok(())
            }
        }
    }

    pub fn get_into(&self, out: &mut [f32], mode: GetMode) -> Result<(), RingBufferError> {
        match mode {
            GetMode::Nowait => {
                let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
                if inner.available_to_read() < out.len() as u64 {
                    return Err(RingBufferError::WouldBlock);
                }
                inner.read_into(out);
                drop(inner);
                self.space_available.notify_all();
                Ok(())
            }
            GetMode::Block => {
                let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
                while inner.available_to_read() < out.len() as u64 {
                    inner = self
                        .data_available
                        .wait(inner)
                        .expect("ring buffer lock poisoned");
                }
                inner.read_into(out);
                drop(inner);
                self.space_available.notify_all();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn put_then_get_roundtrip() {
        let rb = RingBuffer::new(8);
        rb.put(&[1.0, 2.0, 3.0], PutMode::Nowait).unwrap();
        let mut out = [0.0; 3];
        rb.get_into(&mut out, GetMode::Nowait).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn wraparound_splits_into_two_segments() {
        let rb = RingBuffer::new(4);
        rb.put(&[1.0, 2.0, 3.0], PutMode::Nowait).unwrap();
        let mut out = [0.0; 3];
        rb.get_into(&mut out, GetMode::Nowait).unwrap();
        // write cursor is now 3, read cursor 3; next put wraps past the end.
        rb.put(&[4.0, 5.0, 6.0], PutMode::Nowait).unwrap();
        let mut out = [0.0; 3];
        rb.get_into(&mut out, GetMode::Nowait).unwrap();
        assert_eq!(out, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn nowait_put_rejects_without_partial_copy() {
        let rb = RingBuffer::new(4);
        rb.put(&[1.0, 2.0, 3.0], PutMode::Nowait).unwrap();
        let err = rb.put(&[4.0, 5.0], PutMode::Nowait).unwrap_err();
        assert!(matches!(err, RingBufferError::WouldBlock));
        assert_eq!(rb.len(), 3);
    }

    #[test]
    fn nowait_get_rejects_without_partial_copy() {
        let rb = RingBuffer::new(4);
        rb.put(&[1.0], PutMode::Nowait).unwrap();
        let mut out = [0.0; 2];
        let err = rb.get_into(&mut out, GetMode::Nowait).unwrap_err();
        assert!(matches!(err, RingBufferError::WouldBlock));
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn put_past_capacity_is_rejected() {
        let rb = RingBuffer::new(4);
        let err = rb.put(&[0.0; 5], PutMode::Nowait).unwrap_err();
        assert!(matches!(err, RingBufferError::ExceedsCapacity { .. }));
        assert_eq!(rb.len(), 0);
    }

    #[test]
    fn incremental_put_writes_more_than_one_buffer() {
        let rb = Arc::new(RingBuffer::new(4));
        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let writer_rb = rb.clone();
        let writer = thread::spawn(move || {
            writer_rb.put(&data, PutMode::Incremental).unwrap();
        });

        let mut received = Vec::new();
        while received.len() < 10 {
            let mut chunk = [0.0; 2];
            if rb.get_into(&mut chunk, GetMode::Block).is_ok() {
                received.extend_from_slice(&chunk);
            }
        }
        writer.join().unwrap();
        let expected: Vec<f32> = (0..10).map(|i| i as f32).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn block_put_unblocks_once_space_frees() {
        let rb = Arc::new(RingBuffer::new(2));
        rb.put(&[1.0, 2.0], PutMode::Nowait).unwrap();

        let writer_rb = rb.clone();
        let writer = thread::spawn(move || {
            writer_rb.put(&[3.0, 4.0], PutMode::Block).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        let mut out = [0.0; 2];
        rb.get_into(&mut out, GetMode::Block).unwrap();
        assert_eq!(out, [1.0, 2.0]);

        writer.join().unwrap();
        let mut out = [0.0; 2];
        rb.get_into(&mut out, GetMode::Block).unwrap();
        assert_eq!(out, [3.0, 4.0]);
    }

    #[test]
    fn block_get_unblocks_once_data_arrives() {
        let rb = Arc::new(RingBuffer::new(4));
        let reader_rb = rb.clone();
        let reader = thread::spawn(move || {
            let mut out = [0.0; 3];
            reader_rb.get_into(&mut out, GetMode::Block).unwrap();
            out
        });

        thread::sleep(Duration::from_millis(20));
        rb.put(&[7.0, 8.0, 9.0], PutMode::Block).unwrap();
        let out = reader.join().unwrap();
        assert_eq!(out, [7.0, 8.0, 9.0]);
    }
}
