use std::sync::Mutex;

struct Inner {
    data: Vec<u8>,
    head: usize,
    used: usize,
    size: usize,
}

/// Byte ring shared between a producer thread and a consumer thread, with
/// the used/size accessors the status ticker reports to the server.
pub struct SlimBuffer {
    inner: Mutex<Inner>,
}

impl SlimBuffer {
    pub fn new(size: usize) -> Self {
        SlimBuffer {
            inner: Mutex::new(Inner {
                data: vec![0; size],
                head: 0,
                used: 0,
                size,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().map(|b| b.size).unwrap_or(0)
    }

    pub fn used(&self) -> usize {
        self.inner.lock().map(|b| b.used).unwrap_or(0)
    }

    /// Discard all buffered bytes.
    pub fn flush(&self) {
        if let Ok(mut b) = self.inner.lock() {
            b.head = 0;
            b.used = 0;
        }
    }

    /// Flush and reallocate. Used when a new track negotiates a different
    /// buffer size.
    pub fn resize(&self, size: usize) {
        if let Ok(mut b) = self.inner.lock() {
            b.data = vec![0; size];
            b.head = 0;
            b.used = 0;
            b.size = size;
        }
    }

    /// Append up to `buf.len()` bytes, returning how many fitted.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut b = match self.inner.lock() {
            Ok(b) => b,
            Err(_) => return 0,
        };
        if b.size == 0 {
            return 0;
        }
        let room = b.size - b.used;
        let n = buf.len().min(room);
        for (i, byte) in buf[..n].iter().enumerate() {
            let at = (b.head + b.used + i) % b.size;
            b.data[at] = *byte;
        }
        b.used += n;
        n
    }

    /// Remove up to `buf.len()` bytes, returning how many were copied.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut b = match self.inner.lock() {
            Ok(b) => b,
            Err(_) => return 0,
        };
        if b.size == 0 {
            return 0;
        }
        let n = buf.len().min(b.used);
        for item in buf[..n].iter_mut() {
            *item = b.data[b.head];
            b.head = (b.head + 1) % b.size;
        }
        b.used -= n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_used_and_size() {
        let buf = SlimBuffer::new(8);
        assert_eq!(buf.size(), 8);
        assert_eq!(buf.used(), 0);

        assert_eq!(buf.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(buf.used(), 5);

        // Only room for three more
        assert_eq!(buf.write(&[6, 7, 8, 9]), 3);
        assert_eq!(buf.used(), 8);
    }

    #[test]
    fn read_wraps_around() {
        let buf = SlimBuffer::new(4);
        buf.write(&[1, 2, 3]);
        let mut out = [0u8; 2];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(out, [1, 2]);

        buf.write(&[4, 5, 6]);
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn resize_discards_contents() {
        let buf = SlimBuffer::new(4);
        buf.write(&[1, 2, 3]);
        buf.resize(16);
        assert_eq!(buf.size(), 16);
        assert_eq!(buf.used(), 0);
    }
}
