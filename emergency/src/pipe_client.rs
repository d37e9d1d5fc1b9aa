use crate::broker::BrokerChannel;
use crate::messages::BrokerMessage;
use crate::pipe_bindings::{pipe_path, read_status, write_message};
use std::fs::{File, OpenOptions};
use std::os::windows::fs::OpenOptionsExt;
use windows::core::*;
use windows::Win32::Storage::FileSystem::SECURITY_IDENTIFICATION;

/// A connected client end of a broker pipe. Dropping it disconnects.
pub struct PipeChannel {
    pipe: File,
}

/// One connection attempt. A server that isn't up yet shows up as
/// ERROR_FILE_NOT_FOUND (no instance at all) or ERROR_PIPE_BUSY (all
/// instances taken); the caller decides whether to retry.
pub fn connect_pipe(channel: &str) -> Result<PipeChannel> {
    // Only let the server identify us, never impersonate us. Whoever squats
    // on one of our names doesn't get to borrow an elevated token.
    let pipe = OpenOptions::new()
        .read(true)
        .write(true)
        .security_qos_flags(SECURITY_IDENTIFICATION.0)
        .open(pipe_path(channel))?;
    Ok(PipeChannel { pipe })
}

impl BrokerChannel for PipeChannel {
    fn call(&mut self, message: &BrokerMessage) -> Result<()> {
        write_message(&mut self.pipe, &message.encode())?;
        read_status(&mut self.pipe)?.ok()
    }
}
