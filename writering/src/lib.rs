//! A writering keeps a small bank of large memory blocks in front of a file.  Writes append into
//! the block covering their offset and are pushed out with at most one non-blocking write in
//! flight; reads are served from the cached blocks, pulling whole blocks in on a miss.  The caller
//! provides the backing file as a [RingOps] implementation.

extern crate prototk;
#[macro_use]
extern crate prototk_derive;

use biometrics::{Collector, Counter};

use indicio::clue;

use tatl::{HeyListen, Stationary};

use zerror::{iotoz, Z};
use zerror_core::ErrorCore;
use zerror_derive::Z as ZerrorCore;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static WRITE: Counter = Counter::new("writering.write");
static READ: Counter = Counter::new("writering.read");
static RECLAIM: Counter = Counter::new("writering.reclaim");
static FLUSH: Counter = Counter::new("writering.flush");

static SHORT_READ: Counter = Counter::new("writering.short_read");
static SHORT_READ_MONITOR: Stationary = Stationary::new("writering.short_read", &SHORT_READ);

/// Register the biometrics for the writering.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&WRITE);
    collector.register_counter(&READ);
    collector.register_counter(&RECLAIM);
    collector.register_counter(&FLUSH);
    collector.register_counter(&SHORT_READ);
}

/// Register the monitors for the writering.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&SHORT_READ_MONITOR);
}

/// The collector for this crate's clues.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// Error for the writering.
#[derive(Clone, Message, ZerrorCore)]
pub enum Error {
    #[prototk(499712, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(499713, message)]
    SystemError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(499714, message)]
    TruncatedWrite {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, uint64)]
        offset: u64,
        #[prototk(3, uint64)]
        expected: u64,
        #[prototk(4, uint64)]
        written: u64,
    },
    #[prototk(499715, message)]
    LogicError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        context: String,
    },
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

iotoz! {Error}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

////////////////////////////////////////////// RingOps /////////////////////////////////////////////

/// The backing file for a writering.  Non-blocking operations follow start/test/wait:  start may
/// complete the transfer eagerly, but completion is only observed through test or wait, and at
/// most one write and one read are outstanding at a time.
pub trait RingOps {
    /// Called once before the first transfer.  `read`/`write` say which directions are needed.
    fn init(&mut self, read: bool, write: bool) -> Result<(), Error>;
    /// Called when the writering is done with the file.
    fn done(&mut self) -> Result<(), Error>;
    /// Begin a write of `data` at `ofs`.
    fn start_write(&mut self, ofs: u64, data: &[u8]) -> Result<(), Error>;
    /// Poll the outstanding write; Some(bytes) when it finished.
    fn test_write(&mut self) -> Result<Option<u64>, Error>;
    /// Block until the outstanding write finishes.
    fn wait_write(&mut self) -> Result<u64, Error>;
    /// Begin a read into `data` at `ofs`.
    fn start_read(&mut self, ofs: u64, data: &mut [u8]) -> Result<(), Error>;
    /// Poll the outstanding read; Some(bytes) when it finished.
    fn test_read(&mut self) -> Result<Option<u64>, Error>;
    /// Block until the outstanding read finishes.
    fn wait_read(&mut self) -> Result<u64, Error>;
    /// Flush if supported.  Never called with a transfer outstanding.
    fn flush(&mut self) -> Result<(), Error>;
    /// Truncate the file to `size`.
    fn reset(&mut self, size: u64) -> Result<(), Error>;
    /// The file's size.  Only called once the file is open.
    fn size(&mut self) -> Result<u64, Error>;
}

fn backing_write<O: RingOps>(ops: &mut O, ofs: u64, data: &[u8]) -> Result<(), Error> {
    ops.start_write(ofs, data)?;
    let written = ops.wait_write()?;
    if written != data.len() as u64 {
        return Err(Error::TruncatedWrite {
            core: ErrorCore::default(),
            offset: ofs,
            expected: data.len() as u64,
            written,
        });
    }
    Ok(())
}

fn backing_read<O: RingOps>(ops: &mut O, ofs: u64, data: &mut [u8]) -> Result<u64, Error> {
    ops.start_read(ofs, data)?;
    ops.wait_read()
}

/////////////////////////////////////////////// Block //////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lock {
    Free,
    WriteActive,
    ReadActive,
}

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    start: u64,
    used: usize,
    dirty: bool,
    lock: Lock,
}

impl Block {
    fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size],
            start: u64::MAX,
            used: 0,
            dirty: false,
            lock: Lock::Free,
        }
    }

    fn contains(&self, block_size: usize, ofs: u64) -> bool {
        self.start <= ofs && ofs < self.start + block_size as u64
    }
}

///////////////////////////////////////////// WriteRing ////////////////////////////////////////////

/// A write-combining, read-caching bank of blocks over one backing file.
pub struct WriteRing<O: RingOps> {
    ops: O,
    block_size: usize,
    max_blocks: usize,
    blocks: Vec<Block>,
    write_active: Option<usize>,
    write_size: usize,
    read_active: Option<usize>,
    read_enabled: bool,
    write_enabled: bool,
    sync: bool,
    open: bool,
    last_used_block: usize,
    filesize: u64,
    last_read: u64,
    readops: usize,
    debug: bool,
}

impl<O: RingOps> WriteRing<O> {
    /// Create a writering of at most `max_blocks` blocks of `block_size` bytes each.
    pub fn new(block_size: usize, max_blocks: usize, ops: O, read: bool, write: bool) -> Self {
        assert!(block_size > 0);
        assert!(max_blocks > 0);
        Self {
            ops,
            block_size,
            max_blocks,
            blocks: Vec::new(),
            write_active: None,
            write_size: 0,
            read_active: None,
            read_enabled: read,
            write_enabled: write,
            sync: false,
            open: false,
            last_used_block: 0,
            filesize: 0,
            last_read: 0,
            readops: 0,
            debug: false,
        }
    }

    /// Turn extra internal checking on or off.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// In sync mode every transfer goes straight to the backing file.  Entering sync mode flushes
    /// and releases the cache.
    pub fn set_sync(&mut self, sync: bool) -> Result<(), Error> {
        if sync {
            if self.write_enabled {
                self.write_flush()?;
            }
            if self.read_enabled {
                self.read_flush()?;
            }
            self.reduce_mem();
        }
        self.sync = sync;
        Ok(())
    }

    /// The logical size of the file, which may exceed the backing file's size while writes are
    /// still cached.
    pub fn size(&mut self) -> Result<u64, Error> {
        self.ensure_open()?;
        Ok(self.filesize)
    }

    /// Write `data` at `ofs`.
    pub fn write(&mut self, ofs: u64, data: &[u8]) -> Result<(), Error> {
        WRITE.click();
        self.readops = 0;
        self.last_read = 0;
        if data.is_empty() {
            return Ok(());
        }
        if self.sync {
            if ofs + data.len() as u64 > self.filesize {
                self.filesize = ofs + data.len() as u64;
            }
            self.write_active_wait()?;
            self.ensure_open()?;
            return backing_write(&mut self.ops, ofs, data);
        }
        let mut todo = data;
        let mut curofs = ofs;
        while !todo.is_empty() {
            let block = match self.find_block(curofs) {
                Some(block) => {
                    self.backfill_hole(block, curofs)?;
                    block
                }
                None => {
                    let block = self.reclaim_block()?;
                    self.blocks[block].used = 0;
                    self.blocks[block].start = curofs;
                    self.clear_range(curofs, self.block_size as u64)?;
                    block
                }
            };
            let in_block = (curofs - self.blocks[block].start) as usize;
            let this_write = std::cmp::min(self.block_size - in_block, todo.len());
            self.blocks[block].data[in_block..in_block + this_write]
                .copy_from_slice(&todo[..this_write]);
            self.blocks[block].dirty = true;
            self.blocks[block].used = std::cmp::max(self.blocks[block].used, in_block + this_write);
            todo = &todo[this_write..];
            curofs += this_write as u64;
            if curofs > self.filesize {
                self.filesize = curofs;
            }
        }
        if self.debug {
            self.validate();
        }
        Ok(())
    }

    /// Read up to `data.len()` bytes at `ofs`.  Returns the number of bytes produced; zero means
    /// end of file.
    pub fn read(&mut self, ofs: u64, data: &mut [u8]) -> Result<usize, Error> {
        READ.click();
        if ofs > self.last_read || self.readops == 0 {
            self.readops += 1;
        }
        self.last_read = ofs;
        if data.is_empty() {
            return Ok(0);
        }
        if self.sync {
            self.read_active_wait()?;
            self.ensure_open()?;
            return Ok(backing_read(&mut self.ops, ofs, data)? as usize);
        }
        // The logical filesize gates every read, so the backing file's size has to be folded in
        // before the first EOF check.
        self.ensure_open()?;
        let requested = data.len();
        let mut todo = requested;
        let mut curofs = ofs;
        while todo > 0 {
            if curofs >= self.filesize {
                break;
            }
            let block = match self.find_block(curofs) {
                Some(block) => block,
                None => {
                    let block = self.reclaim_block()?;
                    self.blocks[block].start = curofs;
                    self.blocks[block].used = 0;
                    self.clear_range(curofs, self.block_size as u64)?;
                    let used =
                        std::cmp::min(self.block_size as u64, self.filesize - curofs) as usize;
                    self.read_active_wait()?;
                    let got =
                        backing_read(&mut self.ops, curofs, &mut self.blocks[block].data[..used])?
                            as usize;
                    if got < used {
                        self.short_read(curofs, used, got);
                        for byte in self.blocks[block].data[got..used].iter_mut() {
                            *byte = 0;
                        }
                    }
                    self.blocks[block].used = used;
                    block
                }
            };
            // The block covers this offset but may not hold data for it yet; extend it from the
            // backing file up to the logical end of file.
            if self.blocks[block].start + self.blocks[block].used as u64 <= curofs {
                let start = self.blocks[block].start;
                let used = self.blocks[block].used;
                let readsize = std::cmp::min(
                    self.filesize - start - used as u64,
                    (self.block_size - used) as u64,
                ) as usize;
                self.read_active_wait()?;
                let got = backing_read(
                    &mut self.ops,
                    start + used as u64,
                    &mut self.blocks[block].data[used..used + readsize],
                )? as usize;
                if got < readsize {
                    self.short_read(start + used as u64, readsize, got);
                    for byte in self.blocks[block].data[used + got..used + readsize].iter_mut() {
                        *byte = 0;
                    }
                }
                self.blocks[block].used = used + readsize;
            }
            let in_block = (curofs - self.blocks[block].start) as usize;
            let this_read = std::cmp::min(todo, self.blocks[block].used - in_block);
            if this_read == 0 {
                break;
            }
            let copied = requested - todo;
            data[copied..copied + this_read]
                .copy_from_slice(&self.blocks[block].data[in_block..in_block + this_read]);
            todo -= this_read;
            curofs += this_read as u64;
        }
        if self.debug {
            self.validate();
        }
        Ok(requested - todo)
    }

    /// Drain every dirty block to the backing file.  The data stays cached for reads.
    pub fn write_flush(&mut self) -> Result<(), Error> {
        FLUSH.click();
        if self.blocks.is_empty() {
            return Ok(());
        }
        self.write_active_wait()?;
        for block in 0..self.blocks.len() {
            if self.blocks[block].used > 0 && self.blocks[block].dirty {
                self.ensure_open()?;
                backing_write(
                    &mut self.ops,
                    self.blocks[block].start,
                    &self.blocks[block].data[..self.blocks[block].used],
                )?;
                self.blocks[block].dirty = false;
            }
        }
        Ok(())
    }

    /// Wait out any in-flight read and drop all non-dirty blocks.
    pub fn read_flush(&mut self) -> Result<(), Error> {
        if self.blocks.is_empty() {
            return Ok(());
        }
        self.read_active_wait()?;
        for block in self.blocks.iter_mut() {
            if block.used > 0 && !block.dirty {
                block.used = 0;
            }
        }
        Ok(())
    }

    /// Write-flush followed by read-flush.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.write_flush()?;
        self.read_flush()?;
        if self.open {
            self.ops.flush()?;
        }
        Ok(())
    }

    /// Truncate the backing file to `size`, discarding or trimming cached state above it.
    pub fn reset(&mut self, size: u64) -> Result<(), Error> {
        for block in 0..self.blocks.len() {
            if self.blocks[block].used == 0 {
                continue;
            }
            if self.blocks[block].start + self.blocks[block].used as u64 <= size {
                continue;
            }
            if self.blocks[block].start >= size {
                self.blocks[block].start = u64::MAX;
                self.blocks[block].used = 0;
                self.blocks[block].dirty = false;
                continue;
            }
            // The block straddles the new end of file.
            if self.read_active == Some(block) {
                self.read_active_wait()?;
            }
            if self.write_active == Some(block) {
                self.write_active_wait()?;
            }
            self.blocks[block].used = (size - self.blocks[block].start) as usize;
        }
        self.write_active_wait()?;
        self.read_active_wait()?;
        self.ensure_open()?;
        self.ops.reset(size)?;
        self.filesize = size;
        Ok(())
    }

    /// Release all memory that is neither dirty nor locked.
    pub fn reduce_mem(&mut self) {
        let mut map = vec![None; self.blocks.len()];
        let mut kept = Vec::new();
        for (idx, block) in std::mem::take(&mut self.blocks).into_iter().enumerate() {
            if block.used > 0 && (block.dirty || block.lock != Lock::Free) {
                map[idx] = Some(kept.len());
                kept.push(block);
            }
        }
        self.blocks = kept;
        self.write_active = self.write_active.and_then(|idx| map[idx]);
        self.read_active = self.read_active.and_then(|idx| map[idx]);
        self.last_used_block = 0;
    }

    /// Non-blocking tick:  test the in-flight read and write, and if the write side is idle start
    /// a write on the earliest full dirty block.
    pub fn progress(&mut self) -> Result<(), Error> {
        if self.read_active.is_some() {
            if let Some(_got) = self.ops.test_read()? {
                self.finish_read();
            }
        }
        if let Some(block) = self.write_active {
            if let Some(written) = self.ops.test_write()? {
                if written as usize != self.write_size {
                    return Err(Error::TruncatedWrite {
                        core: ErrorCore::default(),
                        offset: self.blocks[block].start,
                        expected: self.write_size as u64,
                        written,
                    });
                }
                self.finish_write();
            }
        }
        if self.write_active.is_none() {
            self.start_background_write()?;
        }
        Ok(())
    }

    /// Flush what remains and close the backing file.  The ring must not be used afterwards.
    pub fn close(&mut self) -> Result<(), Error> {
        self.write_flush()?;
        self.read_active_wait()?;
        self.reduce_mem();
        if self.open {
            self.open = false;
            self.ops.done()?;
        }
        Ok(())
    }

    //////////////////////////////////////////// helpers ///////////////////////////////////////////

    fn ensure_open(&mut self) -> Result<(), Error> {
        if self.open {
            return Ok(());
        }
        self.ops.init(self.read_enabled, self.write_enabled)?;
        self.open = true;
        let real = self.ops.size()?;
        self.filesize = std::cmp::max(self.filesize, real);
        Ok(())
    }

    fn short_read(&self, ofs: u64, wanted: usize, got: usize) {
        SHORT_READ.click();
        clue!(COLLECTOR, indicio::WARNING, {
            short_read: {
                offset: ofs,
                wanted: wanted as u64,
                got: got as u64,
            },
        });
    }

    fn find_block(&mut self, ofs: u64) -> Option<usize> {
        if self.last_used_block < self.blocks.len() {
            let block = &self.blocks[self.last_used_block];
            if block.used > 0 && block.contains(self.block_size, ofs) {
                return Some(self.last_used_block);
            }
        }
        for (idx, block) in self.blocks.iter().enumerate() {
            if block.used > 0 && block.contains(self.block_size, ofs) {
                self.last_used_block = idx;
                return Some(idx);
            }
        }
        None
    }

    // Appending past the block's used tail would leave a hole; fill the gap from the backing
    // file, zero-filling whatever the file does not cover.
    fn backfill_hole(&mut self, block: usize, ofs: u64) -> Result<(), Error> {
        let start = self.blocks[block].start;
        let used = self.blocks[block].used;
        if start + used as u64 >= ofs {
            return Ok(());
        }
        self.read_active_wait()?;
        self.ensure_open()?;
        let readsize = std::cmp::min(
            (self.block_size - used) as u64,
            self.filesize.saturating_sub(start + used as u64),
        ) as usize;
        let got = backing_read(
            &mut self.ops,
            start + used as u64,
            &mut self.blocks[block].data[used..used + readsize],
        )? as usize;
        if got < readsize {
            self.short_read(start + used as u64, readsize, got);
            for byte in self.blocks[block].data[used + got..used + readsize].iter_mut() {
                *byte = 0;
            }
        }
        let mut new_used = used + readsize;
        // Anything still between the backing file's bytes and the write's offset has never been
        // written; it reads back as zero.
        let gap_end = (ofs - start) as usize;
        if new_used < gap_end {
            for byte in self.blocks[block].data[new_used..gap_end].iter_mut() {
                *byte = 0;
            }
            new_used = gap_end;
        }
        self.blocks[block].used = new_used;
        Ok(())
    }

    // Earliest block entirely before the last read offset, preferring clean blocks; otherwise the
    // latest block in file order.  Used when the workload looks like a sequential read phase.
    fn reclaim_pick_read(&self) -> usize {
        let mut clean: Option<usize> = None;
        let mut dirty: Option<usize> = None;
        let mut latest = 0;
        for (idx, block) in self.blocks.iter().enumerate() {
            if block.start > self.blocks[latest].start {
                latest = idx;
            }
            if block.start + block.used as u64 >= self.last_read {
                continue;
            }
            let slot = if block.dirty { &mut dirty } else { &mut clean };
            match slot {
                Some(best) if self.blocks[*best].start <= block.start => {}
                _ => *slot = Some(idx),
            }
        }
        clean.or(dirty).unwrap_or(latest)
    }

    // Smallest clean block, otherwise the fullest dirty one.
    fn reclaim_pick_write(&self) -> usize {
        let mut clean: Option<usize> = None;
        let mut full = 0;
        for (idx, block) in self.blocks.iter().enumerate() {
            if !block.dirty {
                match clean {
                    Some(best) if self.blocks[best].used <= block.used => {}
                    _ => clean = Some(idx),
                }
            } else if self.blocks[full].used < block.used || !self.blocks[full].dirty {
                full = idx;
            }
        }
        clean.unwrap_or(full)
    }

    fn reclaim_block(&mut self) -> Result<usize, Error> {
        RECLAIM.click();
        if self.blocks.len() < self.max_blocks {
            self.blocks.push(Block::new(self.block_size));
            return Ok(self.blocks.len() - 1);
        }
        let mut pick = None;
        for (idx, block) in self.blocks.iter().enumerate() {
            if block.used == 0 {
                pick = Some(idx);
                break;
            }
        }
        let pick = match pick {
            Some(pick) => pick,
            None => {
                if self.readops > 0 {
                    self.reclaim_pick_read()
                } else {
                    self.reclaim_pick_write()
                }
            }
        };
        if self.blocks[pick].used > 0 {
            match self.blocks[pick].lock {
                Lock::WriteActive => self.write_active_wait()?,
                Lock::ReadActive => self.read_active_wait()?,
                Lock::Free => {}
            }
            if self.blocks[pick].dirty {
                self.write_active_wait()?;
                self.ensure_open()?;
                backing_write(
                    &mut self.ops,
                    self.blocks[pick].start,
                    &self.blocks[pick].data[..self.blocks[pick].used],
                )?;
                self.blocks[pick].dirty = false;
            }
            self.blocks[pick].used = 0;
        }
        Ok(pick)
    }

    // Flush and drop every block that could hold bytes from `[ofs, ofs+size)`, so that freshly
    // installed blocks never overlap a cached one.
    fn clear_range(&mut self, ofs: u64, size: u64) -> Result<(), Error> {
        let stop = ofs + size;
        for block in 0..self.blocks.len() {
            if self.blocks[block].used == 0 {
                continue;
            }
            let bstart = self.blocks[block].start;
            let bstop = bstart + self.block_size as u64;
            if bstop <= ofs || bstart >= stop {
                continue;
            }
            match self.blocks[block].lock {
                Lock::WriteActive => self.write_active_wait()?,
                Lock::ReadActive => self.read_active_wait()?,
                Lock::Free => {}
            }
            if self.blocks[block].dirty {
                self.write_active_wait()?;
                self.ensure_open()?;
                backing_write(
                    &mut self.ops,
                    self.blocks[block].start,
                    &self.blocks[block].data[..self.blocks[block].used],
                )?;
            }
            self.blocks[block].used = 0;
            self.blocks[block].dirty = false;
            self.blocks[block].start = u64::MAX;
        }
        if self.debug {
            self.validate();
        }
        Ok(())
    }

    fn start_background_write(&mut self) -> Result<(), Error> {
        let mut pick: Option<usize> = None;
        for (idx, block) in self.blocks.iter().enumerate() {
            if block.used != self.block_size || !block.dirty || block.lock != Lock::Free {
                continue;
            }
            match pick {
                Some(best) if self.blocks[best].start <= block.start => {}
                _ => pick = Some(idx),
            }
        }
        let pick = match pick {
            Some(pick) => pick,
            None => {
                return Ok(());
            }
        };
        self.ensure_open()?;
        self.blocks[pick].lock = Lock::WriteActive;
        self.ops
            .start_write(self.blocks[pick].start, &self.blocks[pick].data[..self.blocks[pick].used])?;
        self.write_active = Some(pick);
        self.write_size = self.blocks[pick].used;
        Ok(())
    }

    fn finish_write(&mut self) {
        if let Some(block) = self.write_active.take() {
            self.blocks[block].dirty = false;
            self.blocks[block].lock = Lock::Free;
        }
    }

    fn finish_read(&mut self) {
        if let Some(block) = self.read_active.take() {
            self.blocks[block].lock = Lock::Free;
        }
    }

    fn write_active_wait(&mut self) -> Result<(), Error> {
        if self.write_active.is_none() {
            return Ok(());
        }
        let written = self.ops.wait_write()?;
        if written as usize != self.write_size {
            return Err(Error::TruncatedWrite {
                core: ErrorCore::default(),
                offset: self
                    .write_active
                    .map(|b| self.blocks[b].start)
                    .unwrap_or(u64::MAX),
                expected: self.write_size as u64,
                written,
            });
        }
        self.finish_write();
        Ok(())
    }

    fn read_active_wait(&mut self) -> Result<(), Error> {
        if self.read_active.is_none() {
            return Ok(());
        }
        self.ops.wait_read()?;
        self.finish_read();
        Ok(())
    }

    // Internal structure checks, enabled by set_debug.
    fn validate(&self) {
        assert!(self.blocks.len() <= self.max_blocks);
        let mut write_locked = 0;
        let mut read_locked = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            match block.lock {
                Lock::WriteActive => write_locked += 1,
                Lock::ReadActive => read_locked += 1,
                Lock::Free => {}
            }
            if block.used == 0 {
                continue;
            }
            assert!(block.used <= self.block_size);
            assert!(block.start + block.used as u64 <= self.filesize);
            for other in self.blocks[i + 1..].iter() {
                if other.used == 0 {
                    continue;
                }
                let disjoint = block.start + block.used as u64 <= other.start
                    || other.start + other.used as u64 <= block.start;
                assert!(disjoint, "writering: overlapping blocks");
            }
        }
        assert!(write_locked <= 1);
        assert!(read_locked <= 1);
    }
}

////////////////////////////////////////////// MemFile /////////////////////////////////////////////

/// An in-memory [RingOps] backing.  Start calls complete eagerly; completion is observed through
/// test and wait, which keeps the non-blocking protocol honest for tests and tools.
#[derive(Debug, Default)]
pub struct MemFile {
    data: Vec<u8>,
    pending_write: Option<u64>,
    pending_read: Option<u64>,
}

impl MemFile {
    /// Create a MemFile holding `data`.
    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data,
            pending_write: None,
            pending_read: None,
        }
    }

    /// The file's current contents.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl RingOps for MemFile {
    fn init(&mut self, _read: bool, _write: bool) -> Result<(), Error> {
        Ok(())
    }

    fn done(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn start_write(&mut self, ofs: u64, data: &[u8]) -> Result<(), Error> {
        if self.pending_write.is_some() {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                context: "start_write with a write outstanding".to_string(),
            });
        }
        let ofs = ofs as usize;
        if self.data.len() < ofs + data.len() {
            self.data.resize(ofs + data.len(), 0);
        }
        self.data[ofs..ofs + data.len()].copy_from_slice(data);
        self.pending_write = Some(data.len() as u64);
        Ok(())
    }

    fn test_write(&mut self) -> Result<Option<u64>, Error> {
        Ok(self.pending_write.take())
    }

    fn wait_write(&mut self) -> Result<u64, Error> {
        match self.pending_write.take() {
            Some(written) => Ok(written),
            None => Err(Error::LogicError {
                core: ErrorCore::default(),
                context: "wait_write without a write outstanding".to_string(),
            }),
        }
    }

    fn start_read(&mut self, ofs: u64, data: &mut [u8]) -> Result<(), Error> {
        if self.pending_read.is_some() {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                context: "start_read with a read outstanding".to_string(),
            });
        }
        let ofs = std::cmp::min(ofs as usize, self.data.len());
        let avail = std::cmp::min(data.len(), self.data.len() - ofs);
        data[..avail].copy_from_slice(&self.data[ofs..ofs + avail]);
        self.pending_read = Some(avail as u64);
        Ok(())
    }

    fn test_read(&mut self) -> Result<Option<u64>, Error> {
        Ok(self.pending_read.take())
    }

    fn wait_read(&mut self) -> Result<u64, Error> {
        match self.pending_read.take() {
            Some(got) => Ok(got),
            None => Err(Error::LogicError {
                core: ErrorCore::default(),
                context: "wait_read without a read outstanding".to_string(),
            }),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn reset(&mut self, size: u64) -> Result<(), Error> {
        self.data.resize(size as usize, 0);
        Ok(())
    }

    fn size(&mut self) -> Result<u64, Error> {
        Ok(self.data.len() as u64)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(block_size: usize, max_blocks: usize) -> WriteRing<MemFile> {
        let mut ring = WriteRing::new(block_size, max_blocks, MemFile::default(), true, true);
        ring.set_debug(true);
        ring
    }

    #[test]
    fn write_then_read_back() {
        let mut ring = ring(64, 2);
        ring.write(0, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(11, ring.read(0, &mut buf).unwrap());
        assert_eq!(b"hello world", &buf);
    }

    #[test]
    fn read_at_eof_returns_zero() {
        let mut ring = ring(64, 2);
        ring.write(0, b"abc").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(0, ring.read(3, &mut buf).unwrap());
        assert_eq!(0, ring.read(100, &mut buf).unwrap());
    }

    #[test]
    fn flush_pushes_bytes_to_the_backing_file() {
        let mut ring = ring(8, 2);
        ring.write(0, b"0123456789abcdef").unwrap();
        ring.flush().unwrap();
        ring.close().unwrap();
        assert_eq!(b"0123456789abcdef", ring.ops.contents());
    }

    #[test]
    fn writes_spanning_blocks() {
        let mut ring = ring(8, 4);
        let payload: Vec<u8> = (0..64u8).collect();
        ring.write(3, &payload).unwrap();
        let mut buf = vec![0u8; 64];
        assert_eq!(64, ring.read(3, &mut buf).unwrap());
        assert_eq!(payload, buf);
        let mut head = [0xffu8; 3];
        assert_eq!(3, ring.read(0, &mut head).unwrap());
        assert_eq!([0, 0, 0], head);
    }

    #[test]
    fn eviction_under_memory_pressure() {
        let mut ring = ring(8, 2);
        for i in 0..8u64 {
            let byte = [i as u8; 8];
            ring.write(i * 8, &byte).unwrap();
        }
        for i in 0..8u64 {
            let mut buf = [0u8; 8];
            assert_eq!(8, ring.read(i * 8, &mut buf).unwrap());
            assert_eq!([i as u8; 8], buf);
        }
    }

    #[test]
    fn hole_fill_reads_the_backing_file() {
        // A fresh ring over a pre-populated file; a small write at 4096 then a read straddling it
        // must see the original bytes around the fresh ones.
        let backing = MemFile::with_contents(vec![0x41u8; 8192]);
        let mut ring = WriteRing::new(4096, 2, backing, true, true);
        ring.set_debug(true);
        ring.write(4096, b"WXYZ").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(10, ring.read(4090, &mut buf).unwrap());
        assert_eq!(&[0x41, 0x41, 0x41, 0x41, 0x41, 0x41, b'W', b'X', b'Y', b'Z'], &buf);
    }

    #[test]
    fn reset_truncates_cache_and_file() {
        let mut ring = ring(8, 4);
        ring.write(0, &[7u8; 32]).unwrap();
        ring.flush().unwrap();
        ring.reset(10).unwrap();
        assert_eq!(10, ring.size().unwrap());
        let mut buf = [0u8; 32];
        assert_eq!(10, ring.read(0, &mut buf).unwrap());
        assert_eq!(&[7u8; 10], &buf[..10]);
        ring.write(10, &[9u8; 6]).unwrap();
        assert_eq!(16, ring.size().unwrap());
    }

    #[test]
    fn sync_mode_bypasses_the_cache() {
        let mut ring = ring(64, 2);
        ring.set_sync(true).unwrap();
        ring.write(0, b"direct").unwrap();
        assert_eq!(b"direct", ring.ops.contents());
        let mut buf = [0u8; 6];
        assert_eq!(6, ring.read(0, &mut buf).unwrap());
        assert_eq!(b"direct", &buf);
    }

    #[test]
    fn progress_starts_a_write_on_a_full_block() {
        let mut ring = ring(8, 2);
        ring.write(0, &[1u8; 8]).unwrap();
        ring.write(8, &[2u8; 3]).unwrap();
        ring.progress().unwrap();
        assert!(ring.write_active.is_some());
        ring.progress().unwrap();
        assert!(ring.write_active.is_none());
        assert_eq!(&[1u8; 8], &ring.ops.contents()[..8]);
    }

    #[test]
    fn reduce_mem_keeps_dirty_blocks() {
        let mut ring = ring(8, 4);
        ring.write(0, &[1u8; 8]).unwrap();
        ring.flush().unwrap();
        ring.write(8, &[2u8; 4]).unwrap();
        ring.reduce_mem();
        assert_eq!(1, ring.blocks.len());
        let mut buf = [0u8; 4];
        assert_eq!(4, ring.read(8, &mut buf).unwrap());
        assert_eq!(&[2u8; 4], &buf);
    }

    #[test]
    fn sequential_reads_reclaim_behind_the_reader() {
        // Fill four blocks, flush, then stream the file front to back with only two banks.  The
        // ring should keep making progress without touching blocks ahead of the reader.
        let mut ring = ring(8, 2);
        let payload: Vec<u8> = (0..32u8).collect();
        ring.write(0, &payload).unwrap();
        ring.flush().unwrap();
        let mut out = Vec::new();
        let mut ofs = 0u64;
        loop {
            let mut buf = [0u8; 8];
            let got = ring.read(ofs, &mut buf).unwrap();
            if got == 0 {
                break;
            }
            out.extend_from_slice(&buf[..got]);
            ofs += got as u64;
        }
        assert_eq!(payload, out);
        assert!(ring.readops > 1);
    }

    #[test]
    fn writes_after_reads_reset_the_read_phase() {
        let mut ring = ring(8, 2);
        ring.write(0, &[1u8; 8]).unwrap();
        let mut buf = [0u8; 8];
        ring.read(0, &mut buf).unwrap();
        assert!(ring.readops > 0);
        ring.write(8, &[2u8; 8]).unwrap();
        assert_eq!(0, ring.readops);
        assert_eq!(0, ring.last_read);
    }

    #[test]
    fn close_flushes_and_releases_everything() {
        let mut ring = ring(16, 3);
        ring.write(0, &[3u8; 40]).unwrap();
        ring.close().unwrap();
        assert!(ring.blocks.is_empty());
        assert!(!ring.open);
        assert_eq!(&[3u8; 40][..], &ring.ops.contents()[..40]);
    }

    #[test]
    fn logical_size_survives_reopen_with_contents() {
        let backing = MemFile::with_contents(vec![5u8; 100]);
        let mut ring = WriteRing::new(32, 2, backing, true, true);
        assert_eq!(100, ring.size().unwrap());
        let mut buf = [0u8; 100];
        assert_eq!(100, ring.read(0, &mut buf).unwrap());
        assert_eq!(&[5u8; 100][..], &buf[..]);
    }
}
