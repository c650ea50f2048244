//! The replay engine moves every range the tree knows about from the data log into the canonical
//! file, as sorted extents of at most one staging buffer each.  In collective mode every rank
//! issues the same number of writes, padding with zero-byte writes, so the target can run the
//! writes as collective operations.

use biometrics::{Collector, Counter};

use rtree::{RTree, Range};

use zerror_core::ErrorCore;

use crate::group::Group;
use crate::logfile::ReplaySink;
use crate::typemap::{calc_access, Typemap};
use crate::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static FLUSH_BUFFERS: Counter = Counter::new("logfs.replay.buffers");
static FLUSH_BYTES: Counter = Counter::new("logfs.replay.bytes");
static FLUSH_FILL_WRITES: Counter = Counter::new("logfs.replay.fill_writes");

/// Register the biometrics for the replay engine.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&FLUSH_BUFFERS);
    collector.register_counter(&FLUSH_BYTES);
    collector.register_counter(&FLUSH_FILL_WRITES);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The data-log offset of an entry injected without backing payload.
pub const DATALOG_INVALID: i64 = -1;

//////////////////////////////////////////// FlushExtent ///////////////////////////////////////////

/// One contiguous piece of a flush buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlushExtent {
    /// Length in bytes.
    pub len: i64,
    /// Byte position in the data log, or [DATALOG_INVALID].
    pub datalog: i64,
    /// Byte position in the canonical file.
    pub canonical: i64,
    /// Byte position in the staging buffer.
    pub bufofs: usize,
}

//////////////////////////////////////////// FlushTarget ///////////////////////////////////////////

/// Where flushed bytes come from and go to.  Reads are issued sorted by data-log offset with
/// buffer placements that leave the staging buffer in canonical order; writes are issued in
/// canonical order.  A write with no extents and zero bytes is the collective no-op.
pub trait FlushTarget {
    /// The flush is starting.
    fn start(&mut self, collective: bool) -> Result<(), Error>;
    /// Read each extent from the data log into `buf` at its `bufofs`.
    fn read_start(&mut self, buf: &mut [u8], extents: &[FlushExtent]) -> Result<(), Error>;
    /// Wait for the outstanding read.
    fn read_wait(&mut self) -> Result<(), Error>;
    /// Write each extent from `buf` to the canonical file at its `canonical` offset.
    fn write_start(&mut self, buf: &[u8], extents: &[FlushExtent], bytes: i64)
        -> Result<(), Error>;
    /// Wait for the outstanding write.
    fn write_wait(&mut self) -> Result<(), Error>;
    /// The flush is over.
    fn stop(&mut self) -> Result<(), Error>;
}

///////////////////////////////////////////// RangeTree ////////////////////////////////////////////

/// The coordinator's range index:  canonical-file byte ranges keyed to data-log offsets, with the
/// running total of bytes indexed.
pub struct RangeTree {
    tree: RTree<i64>,
    rangesize: i64,
}

impl Default for RangeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self {
            tree: RTree::new(),
            rangesize: 0,
        }
    }

    /// Total bytes covered by the tree's entries.
    pub fn range_size(&self) -> i64 {
        self.rangesize
    }

    /// The number of entries.
    pub fn count(&self) -> usize {
        self.tree.count()
    }

    /// True iff the tree holds nothing.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// The covering range of everything indexed.
    pub fn get_range(&self) -> Range {
        self.tree.get_range()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.rangesize = 0;
    }

    /// Visit every entry in key order.
    pub fn walk<F: FnMut(&Range, &i64) -> bool>(&self, f: F) -> bool {
        self.tree.walk(f)
    }

    /// Visit every entry intersecting `range`.
    pub fn overlap<F: FnMut(&Range, &i64) -> bool>(&self, range: &Range, f: F) -> bool {
        self.tree.overlap(range, f)
    }

    /// Exact-match lookup.
    pub fn find(&self, range: &Range) -> Option<&i64> {
        self.tree.find(range)
    }

    /// Insert a new authoritative write.  Existing entries overlapping `[start, stop)` are
    /// removed; a removed entry sticking out on either side is re-inserted for the residue, the
    /// right residue with its data-log offset shifted past the overlapped prefix.
    pub fn add_split(&mut self, start: i64, stop: i64, diskstart: i64) {
        assert!(start < stop);
        let newrange = Range::new(start, stop);
        let mut hits: Vec<(Range, i64)> = Vec::new();
        self.tree.overlap(&newrange, |range, disk| {
            hits.push((*range, *disk));
            true
        });
        for (range, disk) in hits.into_iter() {
            self.tree.remove(&range);
            self.rangesize -= range.size();
            if range.start >= start && range.stop <= stop {
                continue;
            }
            if range.start < start {
                let left = Range::new(range.start, start);
                self.tree.add(left, disk);
                self.rangesize += left.size();
            }
            if range.stop > stop {
                let right = Range::new(stop, range.stop);
                let shifted = if disk == DATALOG_INVALID {
                    DATALOG_INVALID
                } else {
                    disk + (stop - range.start)
                };
                self.tree.add(right, shifted);
                self.rangesize += right.size();
            }
        }
        self.tree.add(newrange, diskstart);
        self.rangesize += newrange.size();
    }
}

/////////////////////////////////////////// TreeBuilder ////////////////////////////////////////////

/// A replay sink that rebuilds the range tree from the meta log, tracking the view as it goes.
pub struct TreeBuilder<'a> {
    tree: &'a mut RangeTree,
    filesize: &'a mut i64,
    displacement: i64,
    etype_size: i64,
    ftype: Typemap,
}

impl<'a> TreeBuilder<'a> {
    /// Build into `tree`, raising `filesize` as writes land.
    pub fn new(tree: &'a mut RangeTree, filesize: &'a mut i64) -> Self {
        Self {
            tree,
            filesize,
            displacement: 0,
            etype_size: 1,
            ftype: Typemap::byte(),
        }
    }
}

impl<'a> ReplaySink for TreeBuilder<'a> {
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn start_epoch(&mut self, _epoch: i32) -> Result<bool, Error> {
        Ok(true)
    }

    fn set_view(
        &mut self,
        displacement: i64,
        etype: Typemap,
        ftype: Typemap,
    ) -> Result<bool, Error> {
        self.displacement = displacement;
        self.etype_size = std::cmp::max(1, etype.size());
        self.ftype = ftype;
        Ok(true)
    }

    fn set_size(&mut self, size: i64) -> Result<bool, Error> {
        *self.filesize = size;
        Ok(true)
    }

    fn write(&mut self, fileofs: i64, size: i32, datalog_ofs: i64) -> Result<bool, Error> {
        let tree = &mut *self.tree;
        let mut local = 0i64;
        calc_access(
            self.etype_size,
            &self.ftype,
            self.displacement,
            fileofs,
            size as i64,
            &mut |start, len| {
                tree.add_split(start, start + len, datalog_ofs + local);
                local += len;
                true
            },
        );
        let stop = tree.get_range().stop;
        if *self.filesize < stop {
            *self.filesize = stop;
        }
        Ok(true)
    }

    fn done(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/////////////////////////////////////////////// flush //////////////////////////////////////////////

struct FlushState<'a, T: FlushTarget> {
    target: &'a mut T,
    bufsize: i64,
    buf: Vec<u8>,
    blocklens: Vec<i64>,
    indices: Vec<i64>,
    realpos: Vec<i64>,
    writesize: i64,
    loops: i64,
}

impl<'a, T: FlushTarget> FlushState<'a, T> {
    // Accept as much of `[rangestart, rangestop)` as fits in the buffer; returns the bytes that
    // did not fit.  An empty range forces the partial buffer out.
    fn add(&mut self, rangestart: i64, rangestop: i64, fileofs: i64) -> Result<i64, Error> {
        let mut thiswrite = rangestop - rangestart;
        let mut leftover = 0;
        let mut forcewrite = false;
        if thiswrite + self.writesize > self.bufsize {
            thiswrite = self.bufsize - self.writesize;
            leftover = rangestop - rangestart - thiswrite;
        }
        if thiswrite > 0 {
            self.blocklens.push(thiswrite);
            self.indices.push(fileofs);
            self.realpos.push(rangestart);
            self.writesize += thiswrite;
        } else {
            // End of data.  With nothing pending there is nothing to force out, and issuing a
            // round here would leave this rank one collective round ahead of the others.
            if self.indices.is_empty() {
                return Ok(0);
            }
            forcewrite = true;
        }
        if self.writesize < self.bufsize && !forcewrite {
            return Ok(leftover);
        }
        self.issue()?;
        Ok(leftover)
    }

    fn issue(&mut self) -> Result<(), Error> {
        FLUSH_BUFFERS.click();
        let segments = self.indices.len();
        if segments > 0 {
            FLUSH_BYTES.count(self.writesize as u64);
            // Buffer placement follows canonical order.
            let mut bufofs = Vec::with_capacity(segments);
            let mut acc = 0usize;
            for len in self.blocklens.iter() {
                bufofs.push(acc);
                acc += *len as usize;
            }
            // The data log is read in data-log order; the placements above put the bytes back in
            // canonical order.
            let mut order: Vec<usize> = (0..segments).collect();
            order.sort_by_key(|&idx| self.indices[idx]);
            let mut read_extents = Vec::with_capacity(segments);
            for idx in order.into_iter() {
                if self.indices[idx] == DATALOG_INVALID {
                    continue;
                }
                read_extents.push(FlushExtent {
                    len: self.blocklens[idx],
                    datalog: self.indices[idx],
                    canonical: self.realpos[idx],
                    bufofs: bufofs[idx],
                });
            }
            let writesize = self.writesize as usize;
            self.target.read_start(&mut self.buf[..writesize], &read_extents)?;
            self.target.read_wait()?;
            // Entries with no backing payload read as zeros.
            for idx in 0..segments {
                if self.indices[idx] == DATALOG_INVALID {
                    let start = bufofs[idx];
                    let stop = start + self.blocklens[idx] as usize;
                    for byte in self.buf[start..stop].iter_mut() {
                        *byte = 0;
                    }
                }
            }
            let mut write_extents = Vec::with_capacity(segments);
            for idx in 0..segments {
                write_extents.push(FlushExtent {
                    len: self.blocklens[idx],
                    datalog: self.indices[idx],
                    canonical: self.realpos[idx],
                    bufofs: bufofs[idx],
                });
            }
            self.target
                .write_start(&self.buf[..writesize], &write_extents, self.writesize)?;
        } else {
            self.target.write_start(&[], &[], 0)?;
        }
        self.target.write_wait()?;
        self.blocklens.clear();
        self.indices.clear();
        self.realpos.clear();
        self.writesize = 0;
        self.loops -= 1;
        Ok(())
    }
}

/// Flush every entry of `tree` through `target` in buffers of `bufsize` bytes.  In collective
/// mode every rank issues the group-maximum number of writes and the new filesize is the group
/// maximum; independent flushes leave `filesize` alone.
pub fn flush<T: FlushTarget, G: Group>(
    tree: &RangeTree,
    bufsize: usize,
    target: &mut T,
    collective: bool,
    filesize: &mut i64,
    group: &G,
) -> Result<(), Error> {
    if bufsize == 0 {
        return Err(Error::InvalidArgument {
            core: ErrorCore::default(),
            what: "flush buffer size must not be zero".to_string(),
        });
    }
    let bufsize = bufsize as i64;
    let mut loops = (tree.range_size() + bufsize - 1) / bufsize;
    if collective {
        let global = group.allreduce_max(loops as u64)? as i64;
        if global > loops {
            loops = global;
        }
    }
    let mut state = FlushState {
        target,
        bufsize,
        buf: vec![0u8; bufsize as usize],
        blocklens: Vec::new(),
        indices: Vec::new(),
        realpos: Vec::new(),
        writesize: 0,
        loops,
    };
    state.target.start(collective)?;
    let mut error: Option<Error> = None;
    tree.walk(|range, fileofs| {
        let mut done = 0;
        let mut todo = range.size();
        while todo > 0 {
            match state.add(range.start + done, range.stop, fileofs + done) {
                Ok(leftover) => {
                    let accepted = range.stop - (range.start + done) - leftover;
                    done += accepted;
                    todo = leftover;
                }
                Err(err) => {
                    error = Some(err);
                    return false;
                }
            }
        }
        true
    });
    if let Some(err) = error {
        return Err(err);
    }
    // End of data:  force out the partial buffer.
    state.add(0, 0, 0)?;
    if collective {
        while state.loops > 0 {
            // The I/O workload can be imbalanced across ranks; issue zero-byte writes until every
            // rank has finished its collective rounds.
            FLUSH_FILL_WRITES.click();
            state.target.write_start(&[], &[], 0)?;
            state.target.write_wait()?;
            state.loops -= 1;
        }
    }
    state.target.stop()?;
    if collective {
        *filesize = group.allreduce_max(*filesize as u64)? as i64;
    }
    Ok(())
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Solo;

    ///////////////////////////////////////// RangeTree ////////////////////////////////////////////

    fn entries(tree: &RangeTree) -> Vec<(i64, i64, i64)> {
        let mut out = Vec::new();
        tree.walk(|r, d| {
            out.push((r.start, r.stop, *d));
            true
        });
        out.sort();
        out
    }

    #[test]
    fn add_split_no_overlap() {
        let mut tree = RangeTree::new();
        tree.add_split(0, 10, 100);
        tree.add_split(20, 30, 200);
        assert_eq!(20, tree.range_size());
        assert_eq!(vec![(0, 10, 100), (20, 30, 200)], entries(&tree));
    }

    #[test]
    fn add_split_replaces_contained_entries() {
        let mut tree = RangeTree::new();
        tree.add_split(10, 20, 100);
        tree.add_split(0, 40, 500);
        assert_eq!(40, tree.range_size());
        assert_eq!(vec![(0, 40, 500)], entries(&tree));
    }

    #[test]
    fn add_split_trims_the_left_neighbor() {
        let mut tree = RangeTree::new();
        tree.add_split(0, 20, 100);
        tree.add_split(10, 30, 200);
        assert_eq!(30, tree.range_size());
        assert_eq!(vec![(0, 10, 100), (10, 30, 200)], entries(&tree));
    }

    #[test]
    fn add_split_splits_a_straddling_entry() {
        let mut tree = RangeTree::new();
        tree.add_split(0, 30, 100);
        tree.add_split(10, 20, 500);
        assert_eq!(30, tree.range_size());
        // The right residue's payload skips the overlapped prefix.
        assert_eq!(vec![(0, 10, 100), (10, 20, 500), (20, 30, 120)], entries(&tree));
    }

    #[test]
    fn add_split_invalid_offsets_stay_invalid() {
        let mut tree = RangeTree::new();
        tree.add_split(0, 30, DATALOG_INVALID);
        tree.add_split(10, 20, 500);
        assert_eq!(
            vec![
                (0, 10, DATALOG_INVALID),
                (10, 20, 500),
                (20, 30, DATALOG_INVALID)
            ],
            entries(&tree)
        );
    }

    /////////////////////////////////////////// flush //////////////////////////////////////////////

    // A flush target over two byte vectors standing in for the data log and the canonical file.
    struct MemTarget {
        datalog: Vec<u8>,
        canonical: Vec<u8>,
        writes: usize,
        started: bool,
        stopped: bool,
    }

    impl MemTarget {
        fn new(datalog: Vec<u8>) -> Self {
            Self {
                datalog,
                canonical: Vec::new(),
                writes: 0,
                started: false,
                stopped: false,
            }
        }
    }

    impl FlushTarget for MemTarget {
        fn start(&mut self, _collective: bool) -> Result<(), Error> {
            self.started = true;
            Ok(())
        }

        fn read_start(&mut self, buf: &mut [u8], extents: &[FlushExtent]) -> Result<(), Error> {
            let mut last = -1i64;
            for extent in extents.iter() {
                assert!(extent.datalog > last, "reads must be in data-log order");
                last = extent.datalog;
                let src = extent.datalog as usize;
                let len = extent.len as usize;
                buf[extent.bufofs..extent.bufofs + len]
                    .copy_from_slice(&self.datalog[src..src + len]);
            }
            Ok(())
        }

        fn read_wait(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn write_start(
            &mut self,
            buf: &[u8],
            extents: &[FlushExtent],
            _bytes: i64,
        ) -> Result<(), Error> {
            self.writes += 1;
            for extent in extents.iter() {
                let dst = extent.canonical as usize;
                let len = extent.len as usize;
                if self.canonical.len() < dst + len {
                    self.canonical.resize(dst + len, 0);
                }
                self.canonical[dst..dst + len]
                    .copy_from_slice(&buf[extent.bufofs..extent.bufofs + len]);
            }
            Ok(())
        }

        fn write_wait(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn stop(&mut self) -> Result<(), Error> {
            self.stopped = true;
            Ok(())
        }
    }

    #[test]
    fn flush_writes_sorted_extents() {
        // Payload written "backwards":  later canonical ranges landed earlier in the data log.
        let mut datalog = vec![0u8; 64];
        for (i, byte) in datalog.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let mut tree = RangeTree::new();
        tree.add_split(32, 48, 0);
        tree.add_split(0, 16, 16);
        let mut target = MemTarget::new(datalog);
        let mut filesize = 48;
        flush(&tree, 1024, &mut target, false, &mut filesize, &Solo).unwrap();
        assert!(target.started && target.stopped);
        let mut expected = vec![0u8; 48];
        expected[32..48].copy_from_slice(&(0..16u8).collect::<Vec<u8>>());
        expected[..16].copy_from_slice(&(16..32u8).collect::<Vec<u8>>());
        assert_eq!(expected, target.canonical);
    }

    #[test]
    fn flush_splits_large_ranges_across_buffers() {
        let datalog: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let mut tree = RangeTree::new();
        tree.add_split(0, 200, 0);
        let mut target = MemTarget::new(datalog.clone());
        let mut filesize = 200;
        flush(&tree, 64, &mut target, false, &mut filesize, &Solo).unwrap();
        assert_eq!(datalog, target.canonical);
        // ceil(200/64) data writes plus the forced partial write.
        assert_eq!(4, target.writes);
    }

    #[test]
    fn flush_of_an_empty_tree_writes_nothing() {
        let tree = RangeTree::new();
        let mut target = MemTarget::new(Vec::new());
        let mut filesize = 0;
        flush(&tree, 64, &mut target, true, &mut filesize, &Solo).unwrap();
        assert!(target.canonical.is_empty());
        assert_eq!(0, target.writes);
        assert!(target.started && target.stopped);
    }

    #[test]
    fn every_rank_issues_the_agreed_number_of_rounds() {
        // One rank's ranges divide the buffer exactly, the other's do not; both must end up
        // issuing the same number of collective writes.
        let mut counts = Vec::new();
        for rangesize in [128i64, 96, 0] {
            let datalog: Vec<u8> = (0..rangesize).map(|i| i as u8).collect();
            let mut tree = RangeTree::new();
            if rangesize > 0 {
                tree.add_split(0, rangesize, 0);
            }
            let mut target = MemTarget::new(datalog);
            let mut filesize = rangesize;
            // Pretend the group agreed on two rounds, the local maximum across the three trees.
            struct TwoLoops;
            impl crate::group::Group for TwoLoops {
                fn rank(&self) -> usize {
                    0
                }
                fn size(&self) -> usize {
                    1
                }
                fn barrier(&self) -> Result<(), Error> {
                    Ok(())
                }
                fn broadcast(&self, _: usize, _: &mut Vec<u8>) -> Result<(), Error> {
                    Ok(())
                }
                fn allreduce_max(&self, value: u64) -> Result<u64, Error> {
                    Ok(std::cmp::max(2, value))
                }
            }
            flush(&tree, 64, &mut target, true, &mut filesize, &TwoLoops).unwrap();
            counts.push(target.writes);
        }
        assert_eq!(counts[0], counts[1]);
        assert_eq!(counts[1], counts[2]);
    }
}
