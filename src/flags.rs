use bitflags::bitflags;

bitflags! {
    /// Flags accepted by `send` and `receive`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        /// Return queued data without consuming it.
        const PEEK = 1 << 0;
        /// Operate on the urgent (out-of-band) queue.
        const URGENT = 1 << 1;
    }
}

bitflags! {
    /// Readiness reported by `poll`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: u32 {
        /// Normal data, a pending connection or end of stream can be read.
        const READ_NORMAL = 1 << 0;
        /// Urgent data is queued.
        const READ_URGENT = 1 << 1;
        /// A send would be buffered.
        const WRITE_NORMAL = 1 << 2;
        /// An error is latched on the socket.
        const ERROR = 1 << 3;
        /// The peer finished sending or no port is left.
        const HANG_UP = 1 << 4;
        /// The socket does not exist.
        const INVALID = 1 << 5;

        /// Reported whether or not they were asked for.
        const ALWAYS = Self::ERROR.bits() | Self::HANG_UP.bits() | Self::INVALID.bits();
    }
}
