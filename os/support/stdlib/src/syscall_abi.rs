/// Interrupt vector of the system call gate.
pub const SYSCALL_VECTOR: u8 = 0x5C;

/// Length of the `int 0x5C` instruction. A call that has to block is
/// restarted by moving the user instruction pointer back by this much.
pub const SYSCALL_INSTRUCTION_LEN: u32 = 2;

/// Return value of a failed call.
pub const SYSCALL_ERROR: u32 = u32::MAX;

/// `wait` argument selecting any child.
pub const WAIT_ANY: u32 = u32::MAX;

#[repr(u32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Sysno {
    /// Give up the CPU. Also the switch request of the timer path.
    Yield = 0,
    /// Duplicate the caller. Returns the child's PID to the parent, 0 to the child.
    Fork = 1,
    /// `exit(code)`.
    Exit = 2,
    /// `wait(pid or WAIT_ANY, *mut status)`. Returns the collected PID.
    Wait = 3,
    GetPid = 4,
    /// `sbrk(increment as i32)`. Returns the previous break.
    Sbrk = 5,
    /// `times(*mut Tms)`. Returns ticks since boot.
    Times = 6,
    /// `sleep(ms)`.
    Sleep = 7,
    /// `register_channel(name, name_len, mode)`.
    RegisterChannel = 8,
    /// `listen(name, name_len, enable)`.
    Listen = 9,
    /// `send(name, name_len, data, data_len, target)`. Returns the number of
    /// recipients.
    Send = 10,
    /// `receive(name, name_len, buf, buf_len, *mut MessageInfo)`. An empty
    /// name receives from any channel. Returns the payload size.
    Receive = 11,
}

impl TryFrom<u32> for Sysno {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            0 => Self::Yield,
            1 => Self::Fork,
            2 => Self::Exit,
            3 => Self::Wait,
            4 => Self::GetPid,
            5 => Self::Sbrk,
            6 => Self::Times,
            7 => Self::Sleep,
            8 => Self::RegisterChannel,
            9 => Self::Listen,
            10 => Self::Send,
            11 => Self::Receive,
            other => return Err(other),
        })
    }
}

/// Who may send on a channel and who receives.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelMode {
    /// Anyone sends, every listener receives.
    Broadcast = 0,
    /// The owner sends to every other listener.
    Multicast = 1,
    /// Everyone but the owner sends, only the owner receives.
    InverseMulticast = 2,
    /// The owner sends to one listener.
    Unicast = 3,
}

impl TryFrom<u32> for ChannelMode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(Self::Broadcast),
            1 => Ok(Self::Multicast),
            2 => Ok(Self::InverseMulticast),
            3 => Ok(Self::Unicast),
            other => Err(other),
        }
    }
}

/// Process times in ticks, as written by `times`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Tms {
    pub tms_utime: u32,
    pub tms_stime: u32,
    pub tms_cutime: u32,
    pub tms_cstime: u32,
}

/// Metadata of a received message, as written by `receive`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct MessageInfo {
    pub uid: u64,
    pub sender: u32,
    /// Full payload size; larger than the buffer if the payload was cut.
    pub size: u32,
}

impl Tms {
    pub const SIZE: usize = size_of::<Self>();

    /// Little-endian image for copying into user memory.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        for (chunk, v) in out
            .chunks_exact_mut(4)
            .zip([self.tms_utime, self.tms_stime, self.tms_cutime, self.tms_cstime])
        {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        out
    }
}

impl MessageInfo {
    pub const SIZE: usize = size_of::<Self>();

    /// Little-endian image for copying into user memory.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[..8].copy_from_slice(&self.uid.to_le_bytes());
        out[8..12].copy_from_slice(&self.sender.to_le_bytes());
        out[12..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

const _: () = {
    assert!(Tms::SIZE == 16);
    assert!(MessageInfo::SIZE == 16);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_numbers_round_trip() {
        for n in 0..12 {
            let sysno = Sysno::try_from(n).unwrap();
            assert_eq!(sysno as u32, n);
        }
        assert_eq!(Sysno::try_from(12), Err(12));
        assert_eq!(ChannelMode::try_from(2), Ok(ChannelMode::InverseMulticast));
        assert_eq!(ChannelMode::try_from(4), Err(4));
    }

    #[test]
    fn user_images() {
        let tms = Tms {
            tms_utime: 1,
            tms_stime: 2,
            tms_cutime: 3,
            tms_cstime: 0x0102_0304,
        };
        assert_eq!(tms.to_bytes()[12..], [4, 3, 2, 1]);
        let info = MessageInfo {
            uid: 7,
            sender: 9,
            size: 3,
        };
        let bytes = info.to_bytes();
        assert_eq!(bytes[0], 7);
        assert_eq!(bytes[8], 9);
        assert_eq!(bytes[12], 3);
    }
}
