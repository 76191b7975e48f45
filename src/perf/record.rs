//! Decodes raw ring-buffer bytes into typed records per the
//! `perf_event_header`/`PERF_RECORD_SAMPLE` layout (spec section 4.3).
//!
//! Field order within a sample record follows the fixed kernel ABI order
//! (`include/uapi/linux/perf_event.h`), not the order `sample_type`'s bits
//! happen to be listed in; `SampleLayout` decodes only the bits this
//! optimizer's event groups ever set (spec section 4.3's `attr()`).

use std::convert::TryInto;

use crate::raw::{perf_event_sample_format::*, RecordType};

/// The fixed sample_type this optimizer ever requests, either the MEM
/// group's superset or the generic group's subset (spec section 4.3).
#[derive(Clone, Copy, Debug)]
pub struct SampleLayout {
    pub has_addr: bool,
    pub has_weight: bool,
    pub has_data_src: bool,
}

impl SampleLayout {
    pub fn for_sample_type(sample_type: u64) -> Self {
        SampleLayout {
            has_addr: sample_type & (PERF_SAMPLE_ADDR as u64) != 0,
            has_weight: sample_type & (PERF_SAMPLE_WEIGHT as u64) != 0,
            has_data_src: sample_type & (PERF_SAMPLE_DATA_SRC as u64) != 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SampleRecord {
    pub ip: u64,
    pub pid: i32,
    pub tid: i32,
    pub time: u64,
    pub addr: u64,
    pub cpu: u32,
    pub period: u64,
    pub weight: u64,
    pub data_src: u64,
}

#[derive(Clone, Debug)]
pub enum Record {
    Sample(SampleRecord),
    Lost { id: u64, lost: u64 },
    Throttle { time: u64 },
    Unthrottle { time: u64 },
    Exit { pid: i32, tid: i32, time: u64 },
    Other(RecordType),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_ne_bytes(bytes.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

/// Decodes one `perf_event_header`-prefixed record from `buf`, returning the
/// record plus how many bytes it consumed. `buf` must start exactly at a
/// header boundary (the ring buffer only ever yields whole records since
/// `drain` copies up to `data_head`, which the kernel always leaves on a
/// record boundary).
pub fn decode(buf: &[u8], layout: SampleLayout) -> Option<(Record, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let raw_type = u32::from_ne_bytes(buf[0..4].try_into().ok()?);
    let size = u16::from_ne_bytes(buf[6..8].try_into().ok()?) as usize;
    if size < 8 || buf.len() < size {
        return None;
    }

    let body = &buf[8..size];
    let record_type = RecordType::from_u32(raw_type);
    let record = match record_type {
        RecordType::Sample => Record::Sample(decode_sample(body, layout)),
        RecordType::Lost => {
            let mut c = Cursor::new(body);
            let id = c.u64().unwrap_or(0);
            let lost = c.u64().unwrap_or(0);
            Record::Lost { id, lost }
        }
        RecordType::Throttle => {
            let mut c = Cursor::new(body);
            Record::Throttle {
                time: c.u64().unwrap_or(0),
            }
        }
        RecordType::Unthrottle => {
            let mut c = Cursor::new(body);
            Record::Unthrottle {
                time: c.u64().unwrap_or(0),
            }
        }
        RecordType::Exit => {
            let mut c = Cursor::new(body);
            let pid = c.u32().unwrap_or(0) as i32;
            let tid = c.u32().unwrap_or(0) as i32;
            let time = c.u64().unwrap_or(0);
            Record::Exit { pid, tid, time }
        }
        other => Record::Other(other),
    };

    Some((record, size))
}

fn decode_sample(body: &[u8], layout: SampleLayout) -> SampleRecord {
    let mut c = Cursor::new(body);
    let mut s = SampleRecord::default();

    s.ip = c.u64().unwrap_or(0);
    s.pid = c.u32().unwrap_or(0) as i32;
    s.tid = c.u32().unwrap_or(0) as i32;
    s.time = c.u64().unwrap_or(0);
    if layout.has_addr {
        s.addr = c.u64().unwrap_or(0);
    }
    if c.remaining() >= 8 {
        s.cpu = c.u32().unwrap_or(0);
        let _res = c.u32();
    }
    s.period = c.u64().unwrap_or(0);
    if layout.has_weight {
        s.weight = c.u64().unwrap_or(0);
    }
    if layout.has_data_src {
        s.data_src = c.u64().unwrap_or(0);
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(raw_type: u32, size: u16) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&raw_type.to_ne_bytes());
        v.extend_from_slice(&0u16.to_ne_bytes()); // misc
        v.extend_from_slice(&size.to_ne_bytes());
        v
    }

    #[test]
    fn decodes_a_generic_sample_without_addr_weight_or_data_src() {
        let layout = SampleLayout {
            has_addr: false,
            has_weight: false,
            has_data_src: false,
        };
        let mut buf = header(9, 8 + 8 + 4 + 4 + 8 + 4 + 4 + 8);
        buf.extend_from_slice(&42u64.to_ne_bytes()); // ip
        buf.extend_from_slice(&100u32.to_ne_bytes()); // pid
        buf.extend_from_slice(&101u32.to_ne_bytes()); // tid
        buf.extend_from_slice(&5000u64.to_ne_bytes()); // time
        buf.extend_from_slice(&3u32.to_ne_bytes()); // cpu
        buf.extend_from_slice(&0u32.to_ne_bytes()); // res
        buf.extend_from_slice(&7u64.to_ne_bytes()); // period

        let (record, consumed) = decode(&buf, layout).unwrap();
        assert_eq!(consumed, buf.len());
        match record {
            Record::Sample(s) => {
                assert_eq!(s.ip, 42);
                assert_eq!(s.pid, 100);
                assert_eq!(s.tid, 101);
                assert_eq!(s.cpu, 3);
                assert_eq!(s.period, 7);
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn decodes_a_lost_record() {
        let mut buf = header(2, 8 + 8 + 8);
        buf.extend_from_slice(&9u64.to_ne_bytes());
        buf.extend_from_slice(&3u64.to_ne_bytes());

        let (record, consumed) = decode(&buf, SampleLayout::for_sample_type(0)).unwrap();
        assert_eq!(consumed, buf.len());
        match record {
            Record::Lost { id, lost } => {
                assert_eq!(id, 9);
                assert_eq!(lost, 3);
            }
            other => panic!("expected lost, got {:?}", other),
        }
    }

    #[test]
    fn truncated_buffer_refuses_to_decode() {
        assert!(decode(&[1, 2, 3], SampleLayout::for_sample_type(0)).is_none());
    }
}
