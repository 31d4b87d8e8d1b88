//! Decoding of raw ring buffer records into [`Event`]s.
//!
//! The header is checked once: its length, then the version and type carried by the tag. The
//! record is then length-checked against the size of its type and copied out with a single
//! unaligned read, since ring buffer samples carry no alignment guarantee.

use serde::Serialize;
use thiserror::Error;

pub use rsswatch_common::EventType;
use rsswatch_common::{
    BrkEnter, BrkExit, Clone3Enter, Clone3Exit, CloneEnter, CloneExit, EventHeader, MmapEnter,
    MmapExit, MremapEnter, MremapExit, Munmap, Record, VforkEnter, VforkExit, HEADER_SIZE,
    TASK_COMM_LEN, WIRE_VERSION,
};

/// Errors that can occur while decoding a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short for a header: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown event type: {raw}")]
    UnknownEventType { raw: u8 },

    #[error("unsupported wire version {version} (expected {})", WIRE_VERSION)]
    UnsupportedVersion { version: u8 },

    #[error("reading {event_type}: {size} bytes, expected {expected}")]
    PayloadTruncated {
        event_type: &'static str,
        size: usize,
        expected: usize,
    },
}

/// The `clone3(2)` arguments captured on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
}

/// The type-specific part of an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    MmapEnter {
        requested_addr: u64,
        size: u64,
        prot: u64,
        flags: u64,
        comm: String,
    },
    MmapExit {
        /// Mapped address, or a negated errno.
        ret: i64,
    },
    MremapEnter {
        old_addr: u64,
        old_size: u64,
        new_addr: u64,
        new_size: u64,
        flags: u64,
        comm: String,
    },
    MremapExit {
        ret: i64,
    },
    Munmap {
        start_addr: u64,
        size: u64,
        comm: String,
    },
    BrkEnter {
        requested_brk: u64,
        comm: String,
    },
    BrkExit {
        actual_brk: u64,
        comm: String,
    },
    CloneEnter {
        flags: u64,
        newsp: u64,
        parent_tid: u64,
        child_tid: u64,
        tls: u64,
        comm: String,
    },
    CloneExit {
        /// Child pid in the parent, 0 in the child, or a negated errno.
        child_pid: i64,
    },
    #[serde(rename = "clone3_enter")]
    Clone3Enter {
        /// `None` when the arguments could not be read from user memory.
        args: Option<CloneArgs>,
        comm: String,
    },
    #[serde(rename = "clone3_exit")]
    Clone3Exit {
        child_pid: i64,
    },
    VforkEnter {
        comm: String,
    },
    VforkExit {
        child_pid: i64,
    },
}

impl Payload {
    /// The child pid returned by a process-creating syscall to its parent.
    pub fn child_pid(&self) -> Option<u32> {
        match *self {
            Payload::CloneExit { child_pid }
            | Payload::Clone3Exit { child_pid }
            | Payload::VforkExit { child_pid }
                if child_pid > 0 =>
            {
                u32::try_from(child_pid).ok()
            }
            _ => None,
        }
    }
}

/// A decoded ring buffer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    #[serde(skip)]
    pub event_type: EventType,
    pub pid: u32,
    pub tid: u32,
    /// `CLOCK_MONOTONIC` nanoseconds.
    pub timestamp_ns: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Event {
    /// The `pid_tid` key an enter and its exit share.
    #[inline(always)]
    pub fn pid_tid(&self) -> u64 {
        rsswatch_common::pid_tid(self.pid, self.tid)
    }
}

/// Decode one raw ring buffer record.
pub fn decode(data: &[u8]) -> Result<Event, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated { size: data.len() });
    }
    // Safety: `EventHeader` is plain old data and `data` holds at least `HEADER_SIZE` bytes.
    let header = unsafe { std::ptr::read_unaligned(data.as_ptr() as *const EventHeader) };
    let (version, raw) = EventType::split_tag(header.type_tag);
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }
    let event_type = EventType::from_u8(raw).ok_or(DecodeError::UnknownEventType { raw })?;

    let payload = match event_type {
        EventType::MmapEnter => {
            let r: MmapEnter = record(data)?;
            Payload::MmapEnter {
                requested_addr: r.requested_addr,
                size: r.size,
                prot: r.prot,
                flags: r.flags,
                comm: comm(&r.comm),
            }
        }
        EventType::MmapExit => Payload::MmapExit {
            ret: record::<MmapExit>(data)?.actual_addr as i64,
        },
        EventType::MremapEnter => {
            let r: MremapEnter = record(data)?;
            Payload::MremapEnter {
                old_addr: r.old_addr,
                old_size: r.old_size,
                new_addr: r.new_addr,
                new_size: r.new_size,
                flags: r.flags,
                comm: comm(&r.comm),
            }
        }
        EventType::MremapExit => Payload::MremapExit {
            ret: record::<MremapExit>(data)?.new_addr as i64,
        },
        EventType::Munmap => {
            let r: Munmap = record(data)?;
            Payload::Munmap {
                start_addr: r.start_addr,
                size: r.size,
                comm: comm(&r.comm),
            }
        }
        EventType::BrkEnter => {
            let r: BrkEnter = record(data)?;
            Payload::BrkEnter {
                requested_brk: r.requested_brk,
                comm: comm(&r.comm),
            }
        }
        EventType::BrkExit => {
            let r: BrkExit = record(data)?;
            Payload::BrkExit {
                actual_brk: r.actual_brk,
                comm: comm(&r.comm),
            }
        }
        EventType::CloneEnter => {
            let r: CloneEnter = record(data)?;
            Payload::CloneEnter {
                flags: r.flags,
                newsp: r.newsp,
                parent_tid: r.parent_tid,
                child_tid: r.child_tid,
                tls: r.tls,
                comm: comm(&r.comm),
            }
        }
        EventType::CloneExit => Payload::CloneExit {
            child_pid: record::<CloneExit>(data)?.child_pid as i64,
        },
        EventType::Clone3Enter => {
            let r: Clone3Enter = record(data)?;
            Payload::Clone3Enter {
                args: (r.args_valid != 0).then(|| CloneArgs {
                    flags: r.flags,
                    pidfd: r.pidfd,
                    child_tid: r.child_tid,
                    parent_tid: r.parent_tid,
                }),
                comm: comm(&r.comm),
            }
        }
        EventType::Clone3Exit => Payload::Clone3Exit {
            child_pid: record::<Clone3Exit>(data)?.child_pid as i64,
        },
        EventType::VforkEnter => Payload::VforkEnter {
            comm: comm(&record::<VforkEnter>(data)?.comm),
        },
        EventType::VforkExit => Payload::VforkExit {
            child_pid: record::<VforkExit>(data)?.child_pid as i64,
        },
    };

    Ok(Event {
        event_type,
        pid: header.pid(),
        tid: header.tid(),
        timestamp_ns: header.timestamp_ns,
        payload,
    })
}

#[inline(always)]
fn record<R: Record>(data: &[u8]) -> Result<R, DecodeError> {
    if data.len() < R::SIZE {
        return Err(DecodeError::PayloadTruncated {
            event_type: R::EVENT_TYPE.as_str(),
            size: data.len(),
            expected: R::SIZE,
        });
    }
    // Safety: `Record` types are valid for every bit pattern; the length was checked above.
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const R) })
}

/// The kernel's `comm` up to the first NUL; it is not NUL-terminated when 16 bytes long.
fn comm(raw: &[u8; TASK_COMM_LEN]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
pub(crate) mod tests {
    use rsswatch_common::pid_tid;

    use super::*;

    pub(crate) fn to_bytes<R: Record>(rec: &R) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(rec as *const R as *const u8, R::SIZE) }.to_vec()
    }

    pub(crate) fn header(event_type: EventType, pid: u32, tid: u32, ts: u64) -> EventHeader {
        EventHeader::new(event_type, pid_tid(pid, tid), ts)
    }

    pub(crate) fn comm16(name: &str) -> [u8; TASK_COMM_LEN] {
        let mut c = [0; TASK_COMM_LEN];
        let n = name.len().min(TASK_COMM_LEN);
        c[..n].copy_from_slice(&name.as_bytes()[..n]);
        c
    }

    #[test]
    fn test_decode_mmap_enter() -> anyhow::Result<()> {
        let rec = MmapEnter {
            header: header(EventType::MmapEnter, 10, 11, 12345),
            requested_addr: 0,
            size: 1 << 20,
            prot: 3,
            flags: 0x22,
            comm: comm16("worker"),
        };
        let ev = decode(&to_bytes(&rec))?;
        assert_eq!(ev.event_type, EventType::MmapEnter);
        assert_eq!((ev.pid, ev.tid, ev.timestamp_ns), (10, 11, 12345));
        assert_eq!(ev.pid_tid(), pid_tid(10, 11));
        assert_eq!(
            ev.payload,
            Payload::MmapEnter {
                requested_addr: 0,
                size: 1 << 20,
                prot: 3,
                flags: 0x22,
                comm: "worker".into(),
            }
        );
        Ok(())
    }

    #[test]
    fn test_decode_unaligned_record() -> anyhow::Result<()> {
        let rec = MmapExit {
            header: header(EventType::MmapExit, 1, 1, 1),
            actual_addr: 0x7f00_0000_0000,
        };
        let mut buf = vec![0u8];
        buf.extend(to_bytes(&rec));
        let ev = decode(&buf[1..])?;
        assert_eq!(ev.payload, Payload::MmapExit { ret: 0x7f00_0000_0000 });
        Ok(())
    }

    #[test]
    fn test_exit_values_are_signed() -> anyhow::Result<()> {
        let rec = CloneExit {
            header: header(EventType::CloneExit, 1, 1, 1),
            child_pid: -11i64 as u64,
        };
        let ev = decode(&to_bytes(&rec))?;
        assert_eq!(ev.payload, Payload::CloneExit { child_pid: -11 });
        assert_eq!(ev.payload.child_pid(), None);

        let rec = VforkExit {
            header: header(EventType::VforkExit, 1, 1, 1),
            child_pid: 4321,
        };
        assert_eq!(decode(&to_bytes(&rec))?.payload.child_pid(), Some(4321));
        Ok(())
    }

    #[test]
    fn test_full_length_comm_has_no_nul() -> anyhow::Result<()> {
        let rec = VforkEnter {
            header: header(EventType::VforkEnter, 1, 1, 1),
            comm: *b"sixteen-byte-cmd",
        };
        match decode(&to_bytes(&rec))?.payload {
            Payload::VforkEnter { comm } => assert_eq!(comm, "sixteen-byte-cmd"),
            p => panic!("unexpected {:?}", p),
        }
        Ok(())
    }

    #[test]
    fn test_clone3_unreadable_args() -> anyhow::Result<()> {
        let rec = Clone3Enter {
            header: header(EventType::Clone3Enter, 1, 1, 1),
            args_valid: 0,
            flags: 0,
            pidfd: 0,
            child_tid: 0,
            parent_tid: 0,
            comm: comm16("sh"),
        };
        let ev = decode(&to_bytes(&rec))?;
        assert_eq!(
            ev.payload,
            Payload::Clone3Enter {
                args: None,
                comm: "sh".into()
            }
        );
        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(&[0; 8]), Err(DecodeError::Truncated { size: 8 }));

        let mut bytes = to_bytes(&MmapExit {
            header: header(EventType::MmapExit, 1, 1, 1),
            actual_addr: 0,
        });
        assert_eq!(
            decode(&bytes[..HEADER_SIZE + 4]),
            Err(DecodeError::PayloadTruncated {
                event_type: "mmap_exit",
                size: HEADER_SIZE + 4,
                expected: 32,
            })
        );

        bytes[0] = 99;
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownEventType { raw: 99 }));

        bytes[0] = EventType::MmapExit as u8;
        bytes[1] = WIRE_VERSION + 1;
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::UnsupportedVersion {
                version: WIRE_VERSION + 1
            })
        );
    }

    #[test]
    fn test_json_shape() -> anyhow::Result<()> {
        let rec = Munmap {
            header: header(EventType::Munmap, 5, 6, 7),
            start_addr: 0x1000,
            size: 0x2000,
            comm: comm16("gc"),
        };
        let json = serde_json::to_value(decode(&to_bytes(&rec))?)?;
        assert_eq!(
            json,
            serde_json::json!({
                "pid": 5,
                "tid": 6,
                "timestamp_ns": 7,
                "kind": "munmap",
                "start_addr": 4096,
                "size": 8192,
                "comm": "gc",
            })
        );
        Ok(())
    }
}
