//! Command buffer builder.

use bytes::{BufMut, Bytes, BytesMut};
use pva_chip::cmd::Command;

/// An encoded stream of firmware commands, ready for submission.
///
/// The submitter splits the stream into pool chunks at command boundaries
/// and appends the link and post-fence commands itself.
#[derive(Debug, Clone, Default)]
pub struct CommandBuffer {
    buf: BytesMut,
}

impl CommandBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one command.
    pub fn push(&mut self, command: &Command) -> &mut Self {
        let mut encoded = Vec::with_capacity(command.encoded_len());
        command.encode_into(&mut encoded);
        self.buf.put_slice(&encoded);
        self
    }

    /// Append several commands.
    pub fn extend<'a>(&mut self, commands: impl IntoIterator<Item = &'a Command>) -> &mut Self {
        for command in commands {
            self.push(command);
        }
        self
    }

    /// Acquire an engine.
    pub fn acquire_engine(&mut self, engine: u32) -> &mut Self {
        self.push(&Command::AcquireEngine { engine })
    }

    /// Release an engine.
    pub fn release_engine(&mut self, engine: u32) -> &mut Self {
        self.push(&Command::ReleaseEngine { engine })
    }

    /// Select the executable whose metadata lives in `resource_id`.
    pub fn set_vpu_executable(&mut self, resource_id: u32) -> &mut Self {
        self.push(&Command::SetVpuExecutable { resource_id })
    }

    /// Run the selected executable.
    pub fn run_vpu(&mut self, entry_point: u32) -> &mut Self {
        self.push(&Command::RunVpu { entry_point })
    }

    /// Bind `resource_id` to a VPU slot.
    pub fn bind(&mut self, slot: u32, resource_id: u32) -> &mut Self {
        self.push(&Command::BindResource { slot, resource_id })
    }

    /// Unbind a VPU slot.
    pub fn unbind(&mut self, slot: u32) -> &mut Self {
        self.push(&Command::UnbindResource { slot })
    }

    /// Write the firmware timestamp into `resource_id` at `offset`.
    pub fn capture_timestamp(&mut self, resource_id: u32, offset: u64) -> &mut Self {
        self.push(&Command::CaptureTimestamp { resource_id, offset })
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no command has been pushed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze into an immutable, cheaply clonable buffer.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl AsRef<[u8]> for CommandBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}
