use easel_core::ConnectionError;

/// Per-connection outbound byte buffer.
///
/// Bytes between the read cursor and `len()` of the backing vector are
/// pending transmission; free capacity after them is where the next frame
/// goes. When a frame does not fit, the storage is replaced by a larger
/// allocation before any frame byte is written, and `generation` advances.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: Vec<u8>,
    read: usize,
    generation: u64,
    max_capacity: usize,
}

impl OutputBuffer {
    pub fn with_capacity(initial: usize, max_capacity: usize) -> Result<Self, ConnectionError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(initial)
            .map_err(|_| ConnectionError::OutOfMemory { requested: initial })?;
        Ok(Self {
            buf,
            read: 0,
            generation: 0,
            max_capacity: max_capacity.max(initial),
        })
    }

    /// Bytes waiting to be written to the transport.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.read..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Upper bound on pending bytes plus the next frame.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Room for the next frame before the pending bytes must drain.
    pub fn frame_budget(&self) -> usize {
        self.max_capacity.saturating_sub(self.len())
    }

    /// Free capacity after the write cursor.
    pub fn remaining(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    /// Incremented every time the backing storage is replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark `n` pending bytes as transmitted.
    pub fn consume(&mut self, n: usize) {
        self.read = (self.read + n).min(self.buf.len());
        if self.read == self.buf.len() {
            self.buf.clear();
            self.read = 0;
        }
    }

    /// Hand the pending bytes to the writer and continue in `spare`.
    ///
    /// The returned vector holds exactly the pending bytes. `spare` is
    /// cleared and becomes the new storage, so the caller can write without
    /// holding the connection lock and recycle the vector afterwards.
    pub fn take_pending(&mut self, mut spare: Vec<u8>) -> Vec<u8> {
        spare.clear();
        if spare.capacity() > self.max_capacity {
            spare = Vec::new();
        }
        let mut taken = std::mem::replace(&mut self.buf, spare);
        if self.read > 0 {
            taken.drain(..self.read);
            self.read = 0;
        }
        self.generation += 1;
        taken
    }

    /// Make room for `needed` more bytes. Returns whether the storage was
    /// replaced. On error the buffer is unchanged.
    pub fn reserve_frame(&mut self, needed: usize) -> Result<bool, ConnectionError> {
        if self.remaining() >= needed {
            return Ok(false);
        }

        // Reclaiming already-sent bytes may be enough.
        if self.read > 0 && self.buf.capacity() - self.len() >= needed {
            self.buf.drain(..self.read);
            self.read = 0;
            return Ok(false);
        }

        let required = self
            .len()
            .checked_add(needed)
            .ok_or(ConnectionError::OutOfMemory {
                requested: usize::MAX,
            })?;
        if required > self.max_capacity {
            return Err(ConnectionError::OutOfMemory {
                requested: required,
            });
        }
        let target = required
            .max(self.buf.capacity().saturating_mul(2))
            .min(self.max_capacity);

        let mut grown = Vec::new();
        grown
            .try_reserve_exact(target)
            .map_err(|_| ConnectionError::OutOfMemory { requested: target })?;
        grown.extend_from_slice(self.pending());

        self.buf = grown;
        self.read = 0;
        self.generation += 1;
        Ok(true)
    }

    /// Append one frame of exactly `len` bytes produced by `encode`.
    ///
    /// Growth happens before `encode` runs. If `encode` writes a different
    /// number of bytes, its output is discarded.
    pub fn write_frame(
        &mut self,
        len: usize,
        encode: impl FnOnce(&mut Vec<u8>),
    ) -> Result<bool, ConnectionError> {
        let grew = self.reserve_frame(len)?;
        let start = self.buf.len();
        let ptr = self.buf.as_ptr();

        encode(&mut self.buf);

        if self.buf.as_ptr() != ptr {
            self.generation += 1;
        }
        let actual = self.buf.len() - start;
        if actual != len {
            self.buf.truncate(start);
            return Err(ConnectionError::FrameLengthMismatch {
                declared: len,
                actual,
            });
        }
        Ok(grew)
    }
}
