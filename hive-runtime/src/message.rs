//! Message format, receive filters and the [`Message`] handle.
//!
//! Every message occupies one buffer of the shared message pool. The first
//! four bytes hold a little-endian [`Header`] (4-bit [`Class`], 28-bit tag);
//! the payload follows. A received message stays in its buffer until the
//! [`Message`] handle is dropped.

use std::fmt;
use std::ptr::NonNull;

use crate::actor::ActorId;
use crate::monitor::MonitorRef;
use crate::scheduler::Kernel;

// ── Header ──────────────────────────────────────────────────────────────────

const CLASS_SHIFT: u32 = 28;
const TAG_MASK: u32 = (1 << CLASS_SHIFT) - 1;

/// Tags with this bit set are generated by the runtime (request
/// correlation). User tags must stay below it.
pub const RUNTIME_TAG_BIT: u32 = 1 << 27;
/// Largest tag accepted from user code.
pub const MAX_USER_TAG: u32 = RUNTIME_TAG_BIT - 1;

/// Tag of the `System` message sent to link partners of a dead actor.
pub const EXIT_TAG: u32 = 1;
/// Tag of the `System` message sent to monitors of a dead actor.
pub const DOWN_TAG: u32 = 2;

/// Message class, the top four bits of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    /// Plain asynchronous (or synchronous) send.
    Notify = 0,
    /// Request expecting a [`Class::Reply`] with the same tag.
    Request = 1,
    /// Answer to a request.
    Reply = 2,
    /// Timer tick; the tag is the timer id.
    Timer = 3,
    /// Runtime notification (exit, down).
    System = 4,
}

impl Class {
    fn from_bits(bits: u32) -> Option<Class> {
        Some(match bits {
            0 => Class::Notify,
            1 => Class::Request,
            2 => Class::Reply,
            3 => Class::Timer,
            4 => Class::System,
            _ => return None,
        })
    }
}

/// Packed class + tag stored at the start of every message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(u32);

impl Header {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4;

    /// Pack `class` and the low 28 bits of `tag`.
    #[must_use]
    pub fn new(class: Class, tag: u32) -> Self {
        Header(((class as u32) << CLASS_SHIFT) | (tag & TAG_MASK))
    }

    /// Decoded class; `None` for a corrupt header.
    #[must_use]
    pub fn class(self) -> Option<Class> {
        Class::from_bits(self.0 >> CLASS_SHIFT)
    }

    /// The 28-bit tag.
    #[must_use]
    pub fn tag(self) -> u32 {
        self.0 & TAG_MASK
    }

    /// Raw encoded value.
    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Write the header into the first [`Header::SIZE`] bytes at `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of four bytes.
    pub(crate) unsafe fn write(self, buf: NonNull<u8>) {
        let bytes = self.0.to_le_bytes();
        // SAFETY: caller guarantees four writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.as_ptr(), Self::SIZE) };
    }

    /// Read the header stored at `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads of four bytes.
    pub(crate) unsafe fn read(buf: NonNull<u8>) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        // SAFETY: caller guarantees four readable bytes.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), bytes.as_mut_ptr(), Self::SIZE) };
        Header(u32::from_le_bytes(bytes))
    }
}

// ── Filter ──────────────────────────────────────────────────────────────────

/// Selective-receive predicate. Unset fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Filter {
    sender: Option<ActorId>,
    class: Option<Class>,
    tag: Option<u32>,
}

impl Filter {
    /// Matches every message.
    #[must_use]
    pub const fn any() -> Self {
        Filter {
            sender: None,
            class: None,
            tag: None,
        }
    }

    /// Only messages from `id`.
    #[must_use]
    pub const fn sender(mut self, id: ActorId) -> Self {
        self.sender = Some(id);
        self
    }

    /// Only messages of `class`.
    #[must_use]
    pub const fn class(mut self, class: Class) -> Self {
        self.class = Some(class);
        self
    }

    /// Only messages carrying `tag`.
    #[must_use]
    pub const fn tag(mut self, tag: u32) -> Self {
        self.tag = Some(tag);
        self
    }

    pub(crate) fn matches(&self, sender: ActorId, header: Header) -> bool {
        let Some(class) = header.class() else {
            return false;
        };
        self.sender.is_none_or(|s| s == sender)
            && self.class.is_none_or(|c| c == class)
            && self.tag.is_none_or(|t| t == header.tag())
    }
}

// ── Exit reasons ────────────────────────────────────────────────────────────

/// Why an actor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Called [`Ctx::exit`](crate::Ctx::exit).
    Normal,
    /// Panicked, or returned without calling `exit`.
    Crash,
    /// Its stack canary was found overwritten.
    StackOverflow,
    /// Application-defined abnormal termination.
    Error(u32),
    /// Stopped by runtime teardown.
    Shutdown,
}

impl ExitReason {
    /// Anything other than `Normal` or `Shutdown`.
    #[must_use]
    pub fn is_abnormal(self) -> bool {
        !matches!(self, ExitReason::Normal | ExitReason::Shutdown)
    }

    fn to_wire(self) -> (u32, u32) {
        match self {
            ExitReason::Normal => (0, 0),
            ExitReason::Crash => (1, 0),
            ExitReason::StackOverflow => (2, 0),
            ExitReason::Error(code) => (3, code),
            ExitReason::Shutdown => (4, 0),
        }
    }

    fn from_wire(kind: u32, detail: u32) -> Option<Self> {
        Some(match kind {
            0 => ExitReason::Normal,
            1 => ExitReason::Crash,
            2 => ExitReason::StackOverflow,
            3 => ExitReason::Error(detail),
            4 => ExitReason::Shutdown,
            _ => return None,
        })
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Crash => f.write_str("crash"),
            ExitReason::StackOverflow => f.write_str("stack overflow"),
            ExitReason::Error(code) => write!(f, "error {code}"),
            ExitReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Decoded exit or down notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    /// The actor that stopped.
    pub actor: ActorId,
    /// Why it stopped.
    pub reason: ExitReason,
    /// The monitor that fired, for down notifications; `None` for link exits.
    pub monitor: Option<MonitorRef>,
}

const EXIT_PAYLOAD_LEN: usize = 16;
pub(crate) const DOWN_PAYLOAD_LEN: usize = 24;

/// Payload of an exit/down notification: actor id, reason kind, reason
/// detail and (down only) monitor ref, all little-endian.
pub(crate) fn encode_exit(
    actor: ActorId,
    reason: ExitReason,
    monitor: Option<MonitorRef>,
) -> ([u8; DOWN_PAYLOAD_LEN], usize) {
    let mut buf = [0u8; DOWN_PAYLOAD_LEN];
    let (kind, detail) = reason.to_wire();
    buf[0..8].copy_from_slice(&actor.as_u64().to_le_bytes());
    buf[8..12].copy_from_slice(&kind.to_le_bytes());
    buf[12..16].copy_from_slice(&detail.to_le_bytes());
    match monitor {
        Some(r) => {
            buf[16..24].copy_from_slice(&r.as_u64().to_le_bytes());
            (buf, DOWN_PAYLOAD_LEN)
        }
        None => (buf, EXIT_PAYLOAD_LEN),
    }
}

fn le_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn le_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Decode an exit or down notification.
///
/// Returns `None` for any message that is not a runtime-generated `System`
/// message with the `EXIT` or `DOWN` tag.
#[must_use]
pub fn decode_exit(msg: &Message<'_>) -> Option<ExitNotice> {
    if msg.sender() != ActorId::SYSTEM || msg.class() != Class::System {
        return None;
    }
    let payload = msg.payload();
    let expected = match msg.tag() {
        EXIT_TAG => EXIT_PAYLOAD_LEN,
        DOWN_TAG => DOWN_PAYLOAD_LEN,
        _ => return None,
    };
    if payload.len() != expected {
        return None;
    }
    let actor = ActorId::from_raw(le_u64(&payload[0..8])?);
    let reason = ExitReason::from_wire(le_u32(&payload[8..12])?, le_u32(&payload[12..16])?)?;
    let monitor = if expected == DOWN_PAYLOAD_LEN {
        Some(MonitorRef::from_raw(le_u64(&payload[16..24])?))
    } else {
        None
    };
    Some(ExitNotice {
        actor,
        reason,
        monitor,
    })
}

// ── Message ─────────────────────────────────────────────────────────────────

/// A received message.
///
/// The handle owns its pool buffer: dropping it (or passing it to
/// [`Ctx::release`](crate::Ctx::release)) returns the buffer and, for a
/// synchronous send, resumes the blocked sender.
pub struct Message<'k> {
    kernel: &'k Kernel,
    owner: ActorId,
    sender: ActorId,
    header: Header,
    buf: NonNull<u8>,
    len: usize,
    sync: Option<u64>,
}

impl<'k> Message<'k> {
    pub(crate) fn new(
        kernel: &'k Kernel,
        owner: ActorId,
        sender: ActorId,
        buf: NonNull<u8>,
        len: usize,
        sync: Option<u64>,
    ) -> Self {
        // SAFETY: `buf` is a live pool buffer holding a header.
        let header = unsafe { Header::read(buf) };
        Message {
            kernel,
            owner,
            sender,
            header,
            buf,
            len,
            sync,
        }
    }

    pub(crate) fn owner(&self) -> ActorId {
        self.owner
    }

    /// Sending actor; [`ActorId::SYSTEM`] for runtime-generated messages.
    #[must_use]
    pub fn sender(&self) -> ActorId {
        self.sender
    }

    /// Message class.
    #[must_use]
    pub fn class(&self) -> Class {
        // Headers are written by the runtime; corrupt ones are skipped by
        // the receive scan and never reach a handle.
        self.header.class().unwrap_or(Class::Notify)
    }

    /// Message tag.
    #[must_use]
    pub fn tag(&self) -> u32 {
        self.header.tag()
    }

    /// The payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: the buffer belongs to this handle until drop and holds
        // `len` payload bytes after the header.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr().add(Header::SIZE), self.len) }
    }

    /// Whether the sender is blocked until this message is released.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.sync.is_some()
    }

    /// Decode as an exit/down notification; see [`decode_exit`].
    #[must_use]
    pub fn exit_notice(&self) -> Option<ExitNotice> {
        decode_exit(self)
    }
}

impl Drop for Message<'_> {
    fn drop(&mut self) {
        self.kernel
            .release_message(self.owner, self.sender, self.buf, self.sync);
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sender", &self.sender)
            .field("class", &self.class())
            .field("tag", &self.tag())
            .field("len", &self.len)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_class_and_tag() {
        let h = Header::new(Class::Reply, RUNTIME_TAG_BIT | 42);
        assert_eq!(h.class(), Some(Class::Reply));
        assert_eq!(h.tag(), RUNTIME_TAG_BIT | 42);
        assert_eq!(h.bits() >> 28, 2);
    }

    #[test]
    fn header_truncates_tag_to_28_bits() {
        let h = Header::new(Class::Notify, u32::MAX);
        assert_eq!(h.tag(), TAG_MASK);
        assert_eq!(h.class(), Some(Class::Notify));
    }

    #[test]
    fn corrupt_class_never_matches() {
        let bad = Header(0xF000_0000);
        assert_eq!(bad.class(), None);
        assert!(!Filter::any().matches(ActorId::SYSTEM, bad));
    }

    #[test]
    fn header_round_trips_through_buffer() {
        let mut storage = [0u8; 8];
        let buf = NonNull::new(storage.as_mut_ptr()).unwrap();
        let h = Header::new(Class::Timer, 77);
        // SAFETY: `storage` has eight bytes.
        let back = unsafe {
            h.write(buf);
            Header::read(buf)
        };
        assert_eq!(back, h);
        assert_eq!(storage[0..4], h.bits().to_le_bytes());
    }

    #[test]
    fn filter_fields_combine() {
        let a = ActorId::from_raw(0x1_0001);
        let b = ActorId::from_raw(0x1_0002);
        let h = Header::new(Class::Request, 9);

        assert!(Filter::any().matches(a, h));
        assert!(Filter::any().sender(a).matches(a, h));
        assert!(!Filter::any().sender(b).matches(a, h));
        assert!(Filter::any().class(Class::Request).tag(9).matches(a, h));
        assert!(!Filter::any().class(Class::Request).tag(8).matches(a, h));
        assert!(!Filter::any().class(Class::Reply).matches(a, h));
    }

    #[test]
    fn exit_payload_layout() {
        let actor = ActorId::from_raw(0xAB_0003);
        let (buf, len) = encode_exit(actor, ExitReason::Error(7), None);
        assert_eq!(len, 16);
        assert_eq!(buf[0..8], 0xAB_0003_u64.to_le_bytes());
        assert_eq!(buf[8..12], 3_u32.to_le_bytes());
        assert_eq!(buf[12..16], 7_u32.to_le_bytes());

        let (buf, len) = encode_exit(actor, ExitReason::Crash, Some(MonitorRef::from_raw(5)));
        assert_eq!(len, 24);
        assert_eq!(buf[16..24], 5_u64.to_le_bytes());
    }

    #[test]
    fn exit_reason_wire_codes_round_trip() {
        for reason in [
            ExitReason::Normal,
            ExitReason::Crash,
            ExitReason::StackOverflow,
            ExitReason::Error(99),
            ExitReason::Shutdown,
        ] {
            let (kind, detail) = reason.to_wire();
            assert_eq!(ExitReason::from_wire(kind, detail), Some(reason));
        }
        assert_eq!(ExitReason::from_wire(17, 0), None);
        assert!(ExitReason::Crash.is_abnormal());
        assert!(!ExitReason::Shutdown.is_abnormal());
    }
}
