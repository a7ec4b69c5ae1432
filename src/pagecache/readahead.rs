//! Readahead Planning
//!
//! Per open file, a small set of stream descriptors tracks sequential
//! access. A read matching a stream's window extends it and earns a
//! readahead sized from the stream's history, the observed download speed
//! and fixed floor/ceiling constants; a read matching nothing evicts the
//! stalest stream and starts over. The `requested_to` watermark keeps
//! successive readaheads from re-requesting the same pages.

use crate::config::PAGE_SIZE;

/// Stream descriptors per open file
pub(crate) const FILESTREAMS_CNT: usize = 6;

/// Readahead floor for a sequential read starting at offset zero
pub(crate) const MIN_READAHEAD_START: u64 = 256 * 1024;

/// Readahead floor for reads elsewhere in the file
pub(crate) const MIN_READAHEAD_RAND: u64 = 64 * 1024;

/// Readahead ceiling
pub(crate) const MAX_READAHEAD: u64 = 8 * 1024 * 1024;

/// Cap readahead at this many seconds of the observed download speed
pub(crate) const MAX_READAHEAD_SEC: u64 = 3;

const PS: u64 = PAGE_SIZE as u64;

#[derive(Clone, Copy, Default)]
struct Stream {
    id: u64,
    from_page: u64,
    to_page: u64,
    length: u64,
    requested_to: u64,
    last_use: i64,
}

/// Sequential-access state of one open file
pub(crate) struct StreamSet {
    streams: [Stream; FILESTREAMS_CNT],
    last_id: u64,
}

/// A planned readahead span
pub(crate) struct ReadaheadSpan {
    /// First page to prefetch
    pub first_page: u64,
    /// Number of pages
    pub page_count: u64,
}

fn round_up_to_page(size: u64) -> u64 {
    ((size - 1) | (PS - 1)) + 1
}

impl StreamSet {
    pub fn new() -> Self {
        Self { streams: [Stream::default(); FILESTREAMS_CNT], last_id: 0 }
    }

    /// Plan the readahead for a page-aligned read of `size` bytes at
    /// `offset`. `has_range` tells whether the read already misses pages
    /// (a fetch will run regardless); `running_reads` suppresses optional
    /// readahead under heavy concurrency.
    pub fn plan(
        &mut self,
        offset: u64,
        size: u64,
        initial_size: u64,
        current_speed: u64,
        running_reads: u32,
        has_range: bool,
        now: i64,
    ) -> Option<ReadaheadSpan> {
        if offset + size >= initial_size {
            return None;
        }
        let from_page = offset / PS;
        let to_page = (offset + size + PS - 1) / PS - 1;
        let mut readahead: u64 = 0;
        let mut fresh_others = 0;
        let mut matched = None;
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if stream.from_page <= from_page && stream.to_page + 2 >= from_page {
                self.last_id += 1;
                stream.id = self.last_id;
                readahead = stream.length;
                stream.from_page = from_page;
                stream.to_page = to_page;
                stream.length += size;
                stream.last_use = now;
                matched = Some(i);
                break;
            } else if stream.last_use >= now - 2 {
                fresh_others += 1;
            }
        }
        let streamid = match matched {
            Some(i) => i,
            None => {
                tracing::debug!("ran out of readahead streams");
                let evict = self
                    .streams
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.id)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                self.last_id += 1;
                self.streams[evict] = Stream {
                    id: self.last_id,
                    from_page,
                    to_page,
                    length: size,
                    requested_to: 0,
                    last_use: now,
                };
                if fresh_others == 1 && current_speed * 4 > readahead && has_range {
                    tracing::debug!(
                        current_speed,
                        "found just one freshly used stream, boosting readahead to four times current speed"
                    );
                    readahead = round_up_to_page(current_speed * 4);
                }
                evict
            }
        };
        if running_reads >= 6 && !has_range {
            return None;
        }
        if offset == 0 && size < MIN_READAHEAD_START && readahead < MIN_READAHEAD_START - size {
            readahead = MIN_READAHEAD_START - size;
        } else if offset == MIN_READAHEAD_START / 2 && readahead == MIN_READAHEAD_START / 2 {
            // Warm start: the second sequential chunk triples the window.
            self.streams[streamid].length += offset;
            readahead = (MIN_READAHEAD_START / 2) * 3;
        } else if offset != 0 && size < MIN_READAHEAD_RAND && readahead < MIN_READAHEAD_RAND - size {
            readahead = MIN_READAHEAD_RAND - size;
        }
        if readahead > MAX_READAHEAD {
            readahead = MAX_READAHEAD;
        }
        if current_speed * MAX_READAHEAD_SEC > MIN_READAHEAD_START
            && readahead > current_speed * MAX_READAHEAD_SEC
        {
            readahead = round_up_to_page(current_speed * MAX_READAHEAD_SEC);
        }
        if !has_range {
            // Align pure readaheads to coarse boundaries so windows tile.
            readahead = match readahead {
                r if r >= 8192 * 1024 => align_span(r, offset + size, 4 * 1024 * 1024),
                r if r >= 2048 * 1024 => align_span(r, offset + size, 1024 * 1024),
                r if r >= 512 * 1024 => align_span(r, offset + size, 256 * 1024),
                r if r >= 128 * 1024 => align_span(r, offset + size, 64 * 1024),
                r => r,
            };
        }
        if offset + size + readahead > initial_size {
            readahead = round_up_to_page(initial_size - offset - size);
        }
        let rto = self.streams[streamid].requested_to;
        if rto < offset + size + readahead {
            self.streams[streamid].requested_to = offset + size + readahead;
        }
        let span = if rto > offset + size {
            if rto > offset + size + readahead {
                return None;
            }
            ReadaheadSpan {
                first_page: rto / PS,
                page_count: (offset + size + readahead - rto) / PS,
            }
        } else {
            ReadaheadSpan { first_page: (offset + size) / PS, page_count: readahead / PS }
        };
        tracing::debug!(
            readahead,
            rto,
            offset,
            size,
            current_speed,
            "readahead planned"
        );
        (span.page_count > 0).then_some(span)
    }
}

fn align_span(readahead: u64, end: u64, boundary: u64) -> u64 {
    ((readahead + end) / boundary * boundary).saturating_sub(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_read_at_zero_gets_start_floor() {
        let mut streams = StreamSet::new();
        let span = streams
            .plan(0, 4096, 10 * 1024 * 1024, 0, 0, true, 100)
            .unwrap();
        assert_eq!(span.first_page, 1);
        // The window reaches MIN_READAHEAD_START past the read.
        assert_eq!(span.page_count * PS, MIN_READAHEAD_START - 4096);
    }

    #[test]
    fn test_sequential_reads_do_not_rerequest() {
        let mut streams = StreamSet::new();
        let first = streams.plan(0, 4096, 10 * 1024 * 1024, 0, 0, true, 100).unwrap();
        let requested_end = (first.first_page + first.page_count) * PS;
        // The next sequential read's window starts at the watermark.
        if let Some(second) = streams.plan(4096, 4096, 10 * 1024 * 1024, 0, 0, true, 100) {
            assert!(second.first_page * PS >= requested_end);
        }
    }

    #[test]
    fn test_random_read_gets_rand_floor() {
        let mut streams = StreamSet::new();
        let span = streams
            .plan(5 * 1024 * 1024, 4096, 10 * 1024 * 1024, 0, 0, true, 100)
            .unwrap();
        assert_eq!(span.page_count * PS, MIN_READAHEAD_RAND - 4096);
    }

    #[test]
    fn test_no_readahead_past_eof() {
        let mut streams = StreamSet::new();
        assert!(streams.plan(8192, 4096, 12288, 0, 0, true, 100).is_none());
    }

    #[test]
    fn test_speed_caps_window() {
        let mut streams = StreamSet::new();
        // Warm the stream so its accumulated length is large.
        streams.plan(0, 1024 * 1024, 100 * 1024 * 1024, 0, 0, true, 100);
        let span = streams
            .plan(1024 * 1024, 1024 * 1024, 100 * 1024 * 1024, 200_000, 0, true, 100)
            .unwrap();
        assert!(span.page_count * PS <= round_up_to_page(200_000 * MAX_READAHEAD_SEC));
    }

    #[test]
    fn test_concurrency_suppresses_optional_readahead() {
        let mut streams = StreamSet::new();
        assert!(streams.plan(0, 4096, 10 * 1024 * 1024, 0, 6, false, 100).is_none());
        // A read that already fetches keeps its readahead.
        assert!(streams.plan(0, 4096, 10 * 1024 * 1024, 0, 6, true, 101).is_some());
    }

    #[test]
    fn test_stalest_stream_is_evicted() {
        let mut streams = StreamSet::new();
        // Six scattered reads claim all descriptors.
        for i in 0..6u64 {
            streams.plan(i * 1024 * 1024 + 65536, 4096, 100 * 1024 * 1024, 0, 0, true, 100 + i as i64);
        }
        // A seventh read matching none must still plan via eviction.
        assert!(streams
            .plan(50 * 1024 * 1024, 4096, 100 * 1024 * 1024, 0, 0, true, 200)
            .is_some());
    }
}
