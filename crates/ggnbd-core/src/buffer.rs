/// Fixed-capacity byte region shared by every request the loop services.
///
/// Sized once for the largest transfer the kernel will hand out and never
/// resized afterwards.
pub struct TransferBuffer {
    data: Box<[u8]>,
}

impl TransferBuffer {
    /// Largest single transfer the gateway device issues (`MAXPHYS`).
    pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
