//! # Named Channels
//!
//! Processes talk through named channels. Sending copies the payload once
//! per recipient into the recipient's mailbox and wakes it if it waits for a
//! message. There is no history: a process that starts listening after a
//! send never sees that message.
//!
//! | Mode               | Who sends        | Who receives                  |
//! |--------------------|------------------|-------------------------------|
//! | `Broadcast`        | anyone           | every listener                |
//! | `Multicast`        | the owner        | every listener but the owner  |
//! | `InverseMulticast` | everyone else    | the owner                     |
//! | `Unicast`          | the owner        | one listener, named by target |
//!
//! Listener lists hold [`ProcessRef`]s; listeners that died are skipped and
//! dropped on the next send.

use crate::arch::Platform;
use crate::kernel::Kernel;
use crate::process::{ProcessId, WaitReason};
use crate::process_ref::ProcessRef;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::task::Poll;
use kernel_vmem::KernelMapper;
use log::{debug, info, warn};
use utils_accessors_derive::Getters;

pub use stdlib::syscall_abi::ChannelMode;

/// Longest accepted channel name, in bytes.
pub const MAX_CHANNEL_NAME: usize = 64;

/// Largest accepted payload, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 0x1_0000;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum IpcError {
    #[error("no such channel")]
    UnknownChannel,
    #[error("channel already registered")]
    ChannelExists,
    #[error("channel names must be 1 to {MAX_CHANNEL_NAME} bytes")]
    InvalidName,
    #[error("process {sender} may not send on this {mode:?} channel")]
    NotPermitted { sender: ProcessId, mode: ChannelMode },
    #[error("no recipient")]
    NoRecipient,
    #[error("no process {0}")]
    UnknownProcess(ProcessId),
    #[error("payload of {0} bytes is too large")]
    TooLarge(usize),
}

/// One delivered copy of a sent payload.
#[derive(Debug, Clone, Eq, PartialEq, Getters)]
pub struct Message {
    #[getters(skip)]
    channel: String,
    #[getters(skip)]
    payload: Vec<u8>,
    /// Shared by every copy of one send.
    #[getters(copy)]
    uid: u64,
    #[getters(copy)]
    sender: ProcessId,
}

impl Message {
    #[must_use]
    pub const fn new(channel: String, payload: Vec<u8>, uid: u64, sender: ProcessId) -> Self {
        Self {
            channel,
            payload,
            uid,
            sender,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[derive(Debug)]
pub struct Channel {
    name: String,
    mode: ChannelMode,
    owner: ProcessId,
    listeners: Vec<ProcessRef>,
}

impl Channel {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn mode(&self) -> ChannelMode {
        self.mode
    }

    #[must_use]
    pub const fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Live listeners in registration order.
    pub fn listeners(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.listeners
            .iter()
            .filter(|l| l.is_valid())
            .map(ProcessRef::pid)
    }

    #[must_use]
    pub fn is_listening(&self, pid: ProcessId) -> bool {
        self.listeners().any(|l| l == pid)
    }

    fn add_listener(&mut self, listener: ProcessRef) -> bool {
        if self.listeners.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    fn remove_listener(&mut self, pid: ProcessId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.pid() != pid);
        self.listeners.len() != before
    }

    /// Drops listeners that died; returns how many.
    fn prune(&mut self) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(ProcessRef::is_valid);
        before - self.listeners.len()
    }

    /// Who gets a message from `sender`.
    ///
    /// # Errors
    /// The mode forbids `sender`, or a unicast target is not listening.
    pub fn recipients(
        &self,
        sender: ProcessId,
        target: Option<ProcessId>,
    ) -> Result<Vec<ProcessId>, IpcError> {
        let not_permitted = IpcError::NotPermitted {
            sender,
            mode: self.mode,
        };
        match self.mode {
            ChannelMode::Broadcast => Ok(self.listeners().collect()),
            ChannelMode::Multicast if sender == self.owner => {
                Ok(self.listeners().filter(|&l| l != self.owner).collect())
            }
            ChannelMode::InverseMulticast if sender != self.owner => Ok(alloc::vec![self.owner]),
            ChannelMode::Unicast if sender == self.owner => match target {
                Some(target) if self.is_listening(target) => Ok(alloc::vec![target]),
                _ => Err(IpcError::NoRecipient),
            },
            _ => Err(not_permitted),
        }
    }
}

/// All channels by name, and the message UID counter.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Channel>,
    next_uid: u64,
}

impl ChannelRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channels: BTreeMap::new(),
            next_uid: 0,
        }
    }

    /// # Errors
    /// Invalid or taken name.
    pub fn register(
        &mut self,
        name: &str,
        mode: ChannelMode,
        owner: ProcessId,
    ) -> Result<(), IpcError> {
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME {
            return Err(IpcError::InvalidName);
        }
        if self.channels.contains_key(name) {
            return Err(IpcError::ChannelExists);
        }
        self.channels.insert(
            name.to_string(),
            Channel {
                name: name.to_string(),
                mode,
                owner,
                listeners: Vec::new(),
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Channel> {
        self.channels.remove(name)
    }

    /// Drops every channel `owner` registered; returns how many.
    pub fn remove_owned_by(&mut self, owner: ProcessId) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, c| c.owner != owner);
        before - self.channels.len()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    const fn next_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }
}

/// A receiving end scoped to one channel.
///
/// Creating one through [`Kernel::receiver`] starts listening; [`close`]
/// stops.
///
/// [`close`]: ChannelReceiver::close
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelReceiver {
    pid: ProcessId,
    channel: String,
}

impl ChannelReceiver {
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Oldest pending message on this channel, without blocking.
    pub fn try_recv<M: KernelMapper, P: Platform>(&self, kernel: &Kernel<M, P>) -> Option<Message> {
        kernel
            .scheduler()
            .lookup(self.pid)?
            .pop_message_on(&self.channel)
    }

    #[must_use]
    pub fn has_pending<M: KernelMapper, P: Platform>(&self, kernel: &Kernel<M, P>) -> bool {
        kernel
            .scheduler()
            .lookup(self.pid)
            .is_some_and(|p| p.has_message_on(&self.channel))
    }

    /// Pops a message or parks the process until one arrives.
    ///
    /// # Errors
    /// The process is gone.
    pub fn recv<M: KernelMapper, P: Platform>(
        &self,
        kernel: &mut Kernel<M, P>,
    ) -> Result<Poll<Message>, IpcError> {
        kernel.receive_on(self.pid, &self.channel)
    }

    /// Stops listening.
    ///
    /// # Errors
    /// The channel is gone.
    pub fn close<M: KernelMapper, P: Platform>(self, kernel: &mut Kernel<M, P>) -> Result<(), IpcError> {
        kernel.listen(self.pid, &self.channel, false).map(|_| ())
    }
}

impl<M: KernelMapper, P: Platform> Kernel<M, P> {
    #[must_use]
    pub const fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// # Errors
    /// Invalid or taken name, unknown owner.
    pub fn register_channel(
        &mut self,
        name: &str,
        mode: ChannelMode,
        owner: ProcessId,
    ) -> Result<(), IpcError> {
        if self.scheduler.lookup(owner).is_none() {
            return Err(IpcError::UnknownProcess(owner));
        }
        self.channels.register(name, mode, owner).inspect_err(|e| {
            warn!("register channel {name:?}: {e}");
        })?;
        info!("channel {name:?} ({mode:?}) registered by {owner}");
        Ok(())
    }

    /// Adds or removes `pid` as a listener. Returns whether anything changed.
    ///
    /// # Errors
    /// Unknown channel or process.
    pub fn listen(&mut self, pid: ProcessId, name: &str, enable: bool) -> Result<bool, IpcError> {
        let channel = self
            .channels
            .channels
            .get_mut(name)
            .ok_or(IpcError::UnknownChannel)?;
        if !enable {
            return Ok(channel.remove_listener(pid));
        }
        let handle = self
            .scheduler
            .lookup(pid)
            .ok_or(IpcError::UnknownProcess(pid))?
            .downgrade();
        Ok(channel.add_listener(handle))
    }

    /// Delivers a copy of `payload` to each recipient the channel's mode
    /// selects, and returns how many got one.
    ///
    /// # Errors
    /// Unknown channel, oversized payload, or the mode forbids the send.
    pub fn send(
        &mut self,
        sender: ProcessId,
        name: &str,
        payload: &[u8],
        target: Option<ProcessId>,
    ) -> Result<usize, IpcError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::TooLarge(payload.len()));
        }
        let channel = self
            .channels
            .channels
            .get_mut(name)
            .ok_or(IpcError::UnknownChannel)?;
        let pruned = channel.prune();
        if pruned > 0 {
            debug!("channel {name:?}: dropped {pruned} dead listeners");
        }
        let mode = channel.mode();
        let recipients = channel.recipients(sender, target).inspect_err(|e| {
            warn!("send on {name:?} by {sender}: {e}");
        })?;
        let uid = self.channels.next_uid();

        let mut delivered = 0;
        for pid in recipients {
            let Some(process) = self.scheduler.lookup(pid).filter(|p| p.is_alive()) else {
                continue;
            };
            process.push_message(Message::new(name.to_string(), payload.to_vec(), uid, sender));
            // Processes blocked on anything else keep the message queued.
            self.scheduler.wake_for(pid, WaitReason::Message);
            delivered += 1;
        }
        if delivered == 0 && matches!(mode, ChannelMode::InverseMulticast | ChannelMode::Unicast) {
            return Err(IpcError::NoRecipient);
        }
        debug!("message {uid} on {name:?} from {sender} reached {delivered} processes");
        Ok(delivered)
    }

    /// Oldest message in the mailbox of `pid`, from any channel, or parks
    /// the process until one arrives.
    ///
    /// # Errors
    /// Unknown process.
    pub fn wait_for_message(&mut self, pid: ProcessId) -> Result<Poll<Message>, IpcError> {
        self.receive_matching(pid, |_| true)
    }

    /// Like [`wait_for_message`](Self::wait_for_message), for one channel.
    ///
    /// # Errors
    /// Unknown process.
    pub fn receive_on(&mut self, pid: ProcessId, name: &str) -> Result<Poll<Message>, IpcError> {
        self.receive_matching(pid, |m| m.channel() == name)
    }

    fn receive_matching(
        &mut self,
        pid: ProcessId,
        select: impl FnMut(&Message) -> bool,
    ) -> Result<Poll<Message>, IpcError> {
        let process = self
            .scheduler
            .lookup(pid)
            .ok_or(IpcError::UnknownProcess(pid))?;
        if let Some(message) = process.take_message(select) {
            return Ok(Poll::Ready(message));
        }
        self.park_for_message(pid)?;
        Ok(Poll::Pending)
    }

    fn park_for_message(&mut self, pid: ProcessId) -> Result<(), IpcError> {
        self.scheduler
            .sleep(pid, WaitReason::Message)
            .map_err(|_| IpcError::UnknownProcess(pid))
    }

    /// Starts listening on `name` and returns a receiver for it.
    ///
    /// # Errors
    /// Unknown channel or process.
    pub fn receiver(&mut self, pid: ProcessId, name: &str) -> Result<ChannelReceiver, IpcError> {
        self.listen(pid, name, true)?;
        Ok(ChannelReceiver {
            pid,
            channel: name.to_string(),
        })
    }

    /// Index of the first receiver with a pending message, or parks `pid`
    /// until a message arrives.
    ///
    /// # Errors
    /// Unknown process.
    pub fn wait_multiple(
        &mut self,
        pid: ProcessId,
        receivers: &[ChannelReceiver],
    ) -> Result<Poll<usize>, IpcError> {
        let process = self
            .scheduler
            .lookup(pid)
            .ok_or(IpcError::UnknownProcess(pid))?;
        if let Some(index) = receivers.iter().position(|r| process.has_message_on(r.channel())) {
            return Ok(Poll::Ready(index));
        }
        self.park_for_message(pid)?;
        Ok(Poll::Pending)
    }
}
