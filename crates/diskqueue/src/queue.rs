use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write as _};

use bytes::Bytes;
use log::{debug, warn};

use crate::record::{Record, RECORD_VALID};
use crate::storage::{FileLike, Storage};
use crate::{DurableQueue, Location, Options, RecoveredRecord};

#[derive(Clone, Copy, Debug)]
struct SegmentInfo {
    /// Queue location of the segment's first byte.
    start: u64,
    /// Bytes in the segment, including any not yet flushed to storage.
    len: u64,
}

impl SegmentInfo {
    fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// The durable queue over a pluggable segment [`Storage`].
///
/// See the crate docs for the on-disk layout. The last segment is the head,
/// open for writing; all older segments are immutable and may be removed by
/// [`DurableQueue::pop`].
pub struct DiskQueue<S: Storage> {
    storage: S,
    opts: Options,
    /// All retained segments, oldest first. Never empty; the last entry is
    /// the head. A segment's `len` is its logical data length; the file
    /// may be longer while a torn tail awaits zero-filling.
    segments: Vec<SegmentInfo>,
    head: BufWriter<S::Segment>,
    next_push: Location,
    next_read: Location,
    cursor: Option<Cursor<S::Segment>>,
    /// Physical end of the torn remains of an incomplete record found by
    /// the recovery scan. The next push zero-fills up to here before
    /// writing its frame.
    dirty_tail: Option<Location>,
}

struct Cursor<F> {
    seg_idx: usize,
    reader: BufReader<F>,
    /// Queue location of the next byte the reader will yield.
    pos: Location,
}

impl<S: Storage> DiskQueue<S> {
    /// Open the queue, resuming any existing segments.
    ///
    /// If the process previously crashed, the tail of the head segment may
    /// hold a torn record; callers must run the recovery scan
    /// ([`DurableQueue::initialize_recovery`] / [`DurableQueue::read_next`])
    /// to establish a clean push boundary before pushing.
    pub fn open(storage: S, opts: Options) -> io::Result<Self> {
        let locations = storage.existing_locations()?;
        let mut segments = Vec::with_capacity(locations.len().max(1));
        for start in locations {
            let len = storage.segment_len(start)?;
            segments.push(SegmentInfo { start, len });
        }

        let head = if let Some(last) = segments.last().copied() {
            debug!("resuming queue segment {}", last.start);
            let mut segment = storage.open_segment(last.start)?;
            segment.seek(SeekFrom::Start(last.len))?;
            segment
        } else {
            debug!("starting fresh queue");
            segments.push(SegmentInfo { start: 0, len: 0 });
            storage.create_segment(0)?
        };

        let next_push = segments.last().expect("at least one segment").end();
        let next_read = segments.first().expect("at least one segment").start;

        Ok(Self {
            storage,
            opts,
            segments,
            head: BufWriter::new(head),
            next_push,
            next_read,
            cursor: None,
            dirty_tail: None,
        })
    }

    fn head_info(&mut self) -> &mut SegmentInfo {
        self.segments.last_mut().expect("at least one segment")
    }

    /// Close the head segment and start a new one at the current push
    /// location.
    fn rotate(&mut self) -> io::Result<()> {
        debug!("rotating queue segment at {}", self.next_push);
        self.head.flush()?;
        self.head.get_mut().fsync()?;

        let segment = self.storage.create_segment(self.next_push)?;
        self.head = BufWriter::new(segment);
        self.segments.push(SegmentInfo {
            start: self.next_push,
            len: 0,
        });

        Ok(())
    }

    /// Note the torn or invalid tail the recovery scan found at `at`: the
    /// head rewinds to the clean boundary and the remains of the
    /// incomplete record are left in place, to be zero-filled by the next
    /// push.
    fn mark_tail(&mut self, at: Location) -> io::Result<()> {
        let idx = self
            .segments
            .iter()
            .rposition(|s| s.start <= at)
            .expect("tail location within a retained segment");

        while self.segments.len() > idx + 1 {
            let seg = self.segments.pop().expect("segment to remove");
            warn!("discarding segment {} past torn tail", seg.start);
            self.storage.remove_segment(seg.start)?;
        }

        let seg = &mut self.segments[idx];
        let physical_end = seg.end();
        seg.len = at - seg.start;

        let mut file = self.storage.open_segment(seg.start)?;
        file.seek(SeekFrom::Start(at - seg.start))?;
        self.head = BufWriter::new(file);
        self.next_push = at;
        self.next_read = at;
        self.cursor = None;
        self.dirty_tail = (physical_end > at).then_some(physical_end);

        warn!("torn queue tail at {at}; zero-filling through {physical_end} on the next push");
        Ok(())
    }

    /// Zero the remains of the incomplete record, so whatever the next
    /// frame does not overwrite reads as a clean boundary.
    fn zero_fill_tail(&mut self, dirty_end: Location) -> io::Result<()> {
        let head_start = self.head_info().start;
        let zeros = vec![0u8; (dirty_end - self.next_push) as usize];
        self.head.write_all(&zeros)?;
        self.head.seek(SeekFrom::Start(self.next_push - head_start))?;
        Ok(())
    }

    /// `true` if everything in `segment` from `from` to its end is zeroes.
    fn is_zero_padding(&self, segment: SegmentInfo, from: Location) -> io::Result<bool> {
        let mut file = self.storage.open_segment(segment.start)?;
        file.seek(SeekFrom::Start(from - segment.start))?;
        let mut rest = vec![0u8; (segment.end() - from) as usize];
        file.read_exact(&mut rest)?;
        Ok(rest.iter().all(|&b| b == 0))
    }
}

impl<S: Storage + Send> DurableQueue for DiskQueue<S> {
    fn push(&mut self, payload: &[u8]) -> io::Result<Location> {
        if let Some(dirty_end) = self.dirty_tail.take() {
            self.zero_fill_tail(dirty_end)?;
        }

        let frame_len = Record::framed_len(payload.len());
        let head = *self.head_info();
        if head.len > 0 && head.len + frame_len > self.opts.max_segment_size {
            self.rotate()?;
        }

        Record::write(payload, &mut self.head)?;
        self.head_info().len += frame_len;
        self.next_push += frame_len;
        if self.cursor.is_none() {
            // Outside of a recovery scan, everything pushed counts as read.
            self.next_read = self.next_push;
        }

        Ok(self.next_push)
    }

    fn commit(&mut self) -> io::Result<()> {
        self.head.flush()?;
        self.head.get_mut().fsync()
    }

    fn pop(&mut self, location: Location) -> io::Result<()> {
        while self.segments.len() > 1 && self.segments[1].start <= location {
            let seg = self.segments.remove(0);
            debug!("popping queue segment {} (end {})", seg.start, seg.end());
            self.storage.remove_segment(seg.start)?;
        }

        Ok(())
    }

    fn read(&self, location: Location, length: u32) -> io::Result<Bytes> {
        let seg = self
            .segments
            .iter()
            .rev()
            .find(|s| s.start <= location)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("queue location {location} has been popped"),
                )
            })?;
        if location + length as u64 > seg.end() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("read of {length} bytes at {location} exceeds segment end {}", seg.end()),
            ));
        }

        let mut file = self.storage.open_segment(seg.start)?;
        file.seek(SeekFrom::Start(location - seg.start))?;
        let mut frame = vec![0u8; length as usize];
        file.read_exact(&mut frame)?;

        let payload_len = u32::from_le_bytes(frame[..4].try_into().expect("4-byte prefix")) as usize;
        if Record::framed_len(payload_len) != length as u64 || frame[length as usize - 1] != RECORD_VALID {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record framing mismatch at {location}"),
            ));
        }

        Ok(Bytes::from(frame).slice(4..4 + payload_len))
    }

    fn initialize_recovery(&mut self, recover_at: Location) -> io::Result<bool> {
        let oldest = self.segments.first().expect("at least one segment").start;
        let begin = recover_at.max(oldest);
        if begin >= self.next_push {
            self.next_read = self.next_push;
            self.cursor = None;
            return Ok(true);
        }

        let seg_idx = self
            .segments
            .iter()
            .rposition(|s| s.start <= begin)
            .expect("begin within a retained segment");
        let seg = self.segments[seg_idx];
        let mut reader = BufReader::new(self.storage.open_segment(seg.start)?);
        reader.seek(SeekFrom::Start(begin - seg.start))?;

        debug!("queue recovery from {begin} (segment {})", seg.start);
        self.cursor = Some(Cursor {
            seg_idx,
            reader,
            pos: begin,
        });
        self.next_read = begin;

        Ok(false)
    }

    fn read_next(&mut self) -> io::Result<Option<RecoveredRecord>> {
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(None);
            };
            let seg = self.segments[cursor.seg_idx];

            if cursor.pos >= seg.end() {
                if cursor.seg_idx + 1 < self.segments.len() {
                    let next = self.segments[cursor.seg_idx + 1];
                    let reader = BufReader::new(self.storage.open_segment(next.start)?);
                    *cursor = Cursor {
                        seg_idx: cursor.seg_idx + 1,
                        reader,
                        pos: next.start,
                    };
                    continue;
                }

                // Clean end of the log.
                self.next_read = self.next_push;
                self.cursor = None;
                return Ok(None);
            }

            let begin = cursor.pos;
            match Record::read(&mut cursor.reader)? {
                Some(payload) => {
                    let end = begin + Record::framed_len(payload.len());
                    cursor.pos = end;
                    self.next_read = end;
                    return Ok(Some(RecoveredRecord {
                        begin,
                        end,
                        payload: payload.into(),
                    }));
                }
                None => {
                    // Zeroes at the end of a closed segment are the
                    // remains of a previously filled tail; skip to the
                    // next segment. Anything else marks the tail of the
                    // log.
                    let final_segment = cursor.seg_idx + 1 == self.segments.len();
                    if !final_segment && self.is_zero_padding(seg, begin)? {
                        debug!("skipping zero padding at {begin} (segment {})", seg.start);
                        if let Some(cursor) = self.cursor.as_mut() {
                            cursor.pos = seg.end();
                        }
                        continue;
                    }

                    self.mark_tail(begin)?;
                    return Ok(None);
                }
            }
        }
    }

    fn next_read_location(&self) -> Location {
        self.next_read
    }

    fn next_push_location(&self) -> Location {
        self.next_push
    }

    fn storage_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mem::Memory;

    fn mem_queue(max_segment_size: u64) -> DiskQueue<Memory> {
        DiskQueue::open(Memory::new(), Options { max_segment_size }).unwrap()
    }

    fn drain(queue: &mut DiskQueue<Memory>, from: Location) -> Vec<RecoveredRecord> {
        let mut out = Vec::new();
        if queue.initialize_recovery(from).unwrap() {
            return out;
        }
        while let Some(rec) = queue.read_next().unwrap() {
            out.push(rec);
        }
        out
    }

    #[test]
    fn push_then_read_roundtrip() {
        let mut queue = mem_queue(1024);

        let begin = queue.next_push_location();
        let end = queue.push(b"first record").unwrap();
        queue.push(b"second record").unwrap();
        queue.commit().unwrap();

        let len = (end - begin) as u32;
        assert_eq!(queue.read(begin, len).unwrap(), Bytes::from_static(b"first record"));
    }

    #[test]
    fn locations_are_monotonic_across_rotation() {
        let mut queue = mem_queue(64);

        let mut prev = queue.next_push_location();
        for i in 0..32u8 {
            let begin = queue.next_push_location();
            assert_eq!(begin, prev);
            let end = queue.push(&[i; 16]).unwrap();
            assert!(end > begin);
            prev = end;
        }
        queue.commit().unwrap();
        assert!(queue.segments.len() > 1, "expected segment rotation");

        // Every record is still readable across the segment boundary.
        let frame = Record::framed_len(16) as u32;
        let mut begin = 0;
        for i in 0..32u8 {
            assert_eq!(queue.read(begin, frame).unwrap(), Bytes::from(vec![i; 16]));
            begin += frame as u64;
        }
    }

    #[test]
    fn recovery_replays_all_records() {
        let storage = Memory::new();
        let mut queue = DiskQueue::open(storage.clone(), Options { max_segment_size: 64 }).unwrap();
        for i in 0..10u8 {
            queue.push(&[i; 16]).unwrap();
        }
        queue.commit().unwrap();
        let pushed_to = queue.next_push_location();
        drop(queue);

        let mut queue = DiskQueue::open(storage, Options { max_segment_size: 64 }).unwrap();
        let recs = drain(&mut queue, 0);
        assert_eq!(recs.len(), 10);
        for (i, rec) in recs.iter().enumerate() {
            assert_eq!(rec.payload, Bytes::from(vec![i as u8; 16]));
        }
        assert_eq!(queue.next_read_location(), pushed_to);
        assert_eq!(queue.next_push_location(), pushed_to);
    }

    #[test]
    fn recovery_from_mid_location_skips_prefix() {
        let mut queue = mem_queue(1024);
        let mut boundaries = vec![queue.next_push_location()];
        for i in 0..5u8 {
            boundaries.push(queue.push(&[i; 8]).unwrap());
        }
        queue.commit().unwrap();

        let recs = drain(&mut queue, boundaries[2]);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].begin, boundaries[2]);
    }

    #[test]
    fn torn_tail_is_zero_filled_by_the_next_push() {
        let storage = Memory::new();
        let mut queue = DiskQueue::open(storage.clone(), Options::default()).unwrap();
        queue.push(b"intact").unwrap();
        let good_end = queue.push(b"will be torn!").unwrap() - Record::framed_len(13);
        queue.commit().unwrap();
        drop(queue);

        // Cut the last record short, as if the process died mid-write.
        let torn_len = {
            let segment = storage.open_segment(0).unwrap();
            let mut buf = segment.buf_mut();
            let torn = buf.len() - 2;
            buf.truncate(torn);
            torn as u64
        };

        let mut queue = DiskQueue::open(storage.clone(), Options::default()).unwrap();
        let recs = drain(&mut queue, 0);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].payload, Bytes::from_static(b"intact"));
        assert_eq!(queue.next_push_location(), good_end);
        // The torn remains stay in place until the next push.
        assert_eq!(storage.open_segment(0).unwrap().len() as u64, torn_len);

        // The next push overwrites the clean boundary and zero-fills the
        // remains its frame does not cover.
        let end = queue.push(b"tiny").unwrap();
        queue.commit().unwrap();
        assert_eq!(end - good_end, Record::framed_len(4));
        let len = (end - good_end) as u32;
        assert_eq!(queue.read(good_end, len).unwrap(), Bytes::from_static(b"tiny"));
        {
            let segment = storage.open_segment(0).unwrap();
            let buf = segment.buf_mut();
            assert!(buf[end as usize..].iter().all(|&b| b == 0), "remains must be zeroed");
            assert_eq!(buf.len() as u64, torn_len);
        }
        drop(queue);

        // Subsequent reads see a clean boundary at the zeroed remains.
        let mut queue = DiskQueue::open(storage, Options::default()).unwrap();
        let recs = drain(&mut queue, 0);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].payload, Bytes::from_static(b"tiny"));
        assert_eq!(queue.next_push_location(), end);
    }

    #[test]
    fn invalid_flag_marks_tail() {
        let storage = Memory::new();
        let mut queue = DiskQueue::open(storage.clone(), Options::default()).unwrap();
        queue.push(b"ok").unwrap();
        queue.push(b"bad flag").unwrap();
        queue.commit().unwrap();
        let physical_len = storage.open_segment(0).unwrap().len();
        drop(queue);

        {
            let segment = storage.open_segment(0).unwrap();
            let mut buf = segment.buf_mut();
            let last = buf.len() - 1;
            buf[last] = 0;
        }

        let mut queue = DiskQueue::open(storage.clone(), Options::default()).unwrap();
        let recs = drain(&mut queue, 0);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].payload, Bytes::from_static(b"ok"));
        // Marking the tail leaves the file alone; pushing reclaims it.
        assert_eq!(storage.open_segment(0).unwrap().len(), physical_len);

        let end = queue.push(b"recovered").unwrap();
        queue.commit().unwrap();
        let len = (end - recs[0].end) as u32;
        assert_eq!(queue.read(recs[0].end, len).unwrap(), Bytes::from_static(b"recovered"));
    }

    #[test]
    fn zero_padding_before_a_segment_boundary_is_skipped() {
        let storage = Memory::new();
        let mut queue = DiskQueue::open(storage.clone(), Options { max_segment_size: 64 }).unwrap();
        for i in 0..8u8 {
            queue.push(&[i; 16]).unwrap();
        }
        queue.commit().unwrap();
        assert!(queue.segments.len() > 1, "expected segment rotation");
        drop(queue);

        // Zeroes left at the end of a closed segment, as a filled tail
        // followed by a rotation leaves them.
        {
            let segment = storage.open_segment(0).unwrap();
            segment.buf_mut().extend_from_slice(&[0u8; 10]);
        }

        let mut queue = DiskQueue::open(storage, Options { max_segment_size: 64 }).unwrap();
        let recs = drain(&mut queue, 0);
        assert_eq!(recs.len(), 8);
        for (i, rec) in recs.iter().enumerate() {
            assert_eq!(rec.payload, Bytes::from(vec![i as u8; 16]));
        }
    }

    #[test]
    fn pop_releases_whole_segments() {
        let mut queue = mem_queue(64);
        let mut ends = Vec::new();
        for i in 0..16u8 {
            ends.push(queue.push(&[i; 16]).unwrap());
        }
        queue.commit().unwrap();

        let before = queue.storage_bytes();
        queue.pop(ends[7]).unwrap();
        let after = queue.storage_bytes();
        assert!(after < before, "expected {after} < {before}");

        // Reads before the pop point now fail; reads after still work.
        let frame = Record::framed_len(16) as u32;
        assert!(queue.read(0, frame).is_err());
        let last_begin = ends[15] - frame as u64;
        assert_eq!(queue.read(last_begin, frame).unwrap(), Bytes::from(vec![15u8; 16]));
    }

    #[test]
    fn pop_never_releases_the_head() {
        let mut queue = mem_queue(1024 * 1024);
        let end = queue.push(b"resident").unwrap();
        queue.commit().unwrap();

        queue.pop(end + 1000).unwrap();
        assert_eq!(queue.segments.len(), 1);
    }

    #[test]
    fn empty_queue_has_nothing_to_replay() {
        let mut queue = mem_queue(1024);
        assert!(queue.initialize_recovery(0).unwrap());
        assert_eq!(queue.read_next().unwrap(), None);
    }

    #[test]
    fn fs_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::fs::Fs::new(dir.path()).unwrap();

        let mut queue = DiskQueue::open(storage.clone(), Options { max_segment_size: 64 }).unwrap();
        let mut ends = Vec::new();
        for i in 0..8u8 {
            ends.push(queue.push(&[i; 16]).unwrap());
        }
        queue.commit().unwrap();
        drop(queue);

        let mut queue = DiskQueue::open(storage, Options { max_segment_size: 64 }).unwrap();
        assert!(!queue.initialize_recovery(0).unwrap());
        let mut recovered = Vec::new();
        while let Some(rec) = queue.read_next().unwrap() {
            recovered.push(rec);
        }
        assert_eq!(recovered.len(), 8);
        assert_eq!(recovered[3].payload, Bytes::from(vec![3u8; 16]));
        assert_eq!(queue.next_push_location(), *ends.last().unwrap());

        let frame = Record::framed_len(16) as u32;
        assert_eq!(queue.read(0, frame).unwrap(), Bytes::from(vec![0u8; 16]));
    }
}
