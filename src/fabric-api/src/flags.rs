use bitflags::bitflags;

bitflags! {
    /// Flags describing a completed operation.
    #[derive(Default)]
    pub struct CompletionFlags: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
        const REMOTE_CQ_DATA = 1 << 24;
    }

    /// Which operations of an endpoint report to a bound counter or
    /// completion queue.
    #[derive(Default)]
    pub struct BindFlags: u64 {
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        /// Alias used when binding completion queues for the transmit side.
        const TRANSMIT = Self::SEND.bits;
    }
}
