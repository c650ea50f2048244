//! The per-process journal:  a meta log of typed records and a data log of raw payload, addressed
//! through a two-channel store.  View, size, and sync changes are recorded lazily and flushed, in
//! that order, ahead of the next data record, so repeated state changes collapse into one
//! persisted record.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use biometrics::{Collector, Counter};

use writering::{RingOps, WriteRing};

use zerror_core::ErrorCore;

use crate::typemap::Typemap;
use crate::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static RECORD_VIEW_FLUSHED: Counter = Counter::new("logfs.logfile.view");
static RECORD_SIZE_FLUSHED: Counter = Counter::new("logfs.logfile.setsize");
static RECORD_SYNC_FLUSHED: Counter = Counter::new("logfs.logfile.sync");
static RECORD_DATA: Counter = Counter::new("logfs.logfile.data");
static REPLAY_RECORDS: Counter = Counter::new("logfs.logfile.replay_records");

/// Register the biometrics for the log-file engine.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&RECORD_VIEW_FLUSHED);
    collector.register_counter(&RECORD_SIZE_FLUSHED);
    collector.register_counter(&RECORD_SYNC_FLUSHED);
    collector.register_counter(&RECORD_DATA);
    collector.register_counter(&REPLAY_RECORDS);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The magic both log files begin with, zero-padded to [LOG_HEADER_SIZE].
pub const LOG_MAGIC: &[u8; 6] = b"logfs\n";
/// Size of the header at the front of the meta and data logs.
pub const LOG_HEADER_SIZE: usize = 64;
/// Size of the fixed header in front of every meta-log record.
pub const RECORD_HEADER_SIZE: usize = 16;

/// A new displacement and two flattened typemaps follow.
pub const RECORD_VIEW: i32 = 1;
/// Byte size, file offset in etypes, and the data-log offset of the payload follow.
pub const RECORD_DATA_TAG: i32 = 2;
/// The epoch number follows.
pub const RECORD_SYNC: i32 = 3;
/// The canonical filesize follows.
pub const RECORD_SETSIZE: i32 = 4;

//////////////////////////////////////////// LogChannel ////////////////////////////////////////////

/// The two per-process log files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogChannel {
    /// The record stream.
    Meta,
    /// The raw payload concatenation.
    Data,
}

////////////////////////////////////////////// traits //////////////////////////////////////////////

/// The write side of the channel store the engine appends through.
pub trait LogStore {
    /// Prepare both channels for writing.
    fn init(&mut self) -> Result<(), Error>;
    /// Write `data` at `ofs` on the channel.
    fn write(&mut self, chan: LogChannel, ofs: u64, data: &[u8]) -> Result<(), Error>;
    /// Truncate the channel to `ofs`.
    fn restart(&mut self, chan: LogChannel, ofs: u64) -> Result<(), Error>;
    /// The channel's current size.
    fn size(&mut self, chan: LogChannel) -> Result<u64, Error>;
    /// Close both channels.
    fn done(&mut self) -> Result<(), Error>;
}

/// The read side, used by header probing and replay.
pub trait LogReader {
    /// Prepare the meta channel for reading.
    fn reader_init(&mut self) -> Result<(), Error>;
    /// Read from the channel at `ofs`; returns the number of bytes produced.
    fn read(&mut self, chan: LogChannel, ofs: u64, data: &mut [u8]) -> Result<usize, Error>;
    /// Close the read side.
    fn reader_done(&mut self) -> Result<(), Error>;
}

/// The consumer driven by [LogFile::replay].  Callbacks return Ok(false) to stop the replay.
pub trait ReplaySink {
    /// Called once, before the first record is dispatched.
    fn init(&mut self) -> Result<(), Error>;
    /// A SYNC record:  a new epoch begins.
    fn start_epoch(&mut self, epoch: i32) -> Result<bool, Error>;
    /// A VIEW record.  The data representation is always "native".
    fn set_view(&mut self, displacement: i64, etype: Typemap, ftype: Typemap)
        -> Result<bool, Error>;
    /// A SETSIZE record.
    fn set_size(&mut self, size: i64) -> Result<bool, Error>;
    /// A DATA record:  `size` bytes for file offset `fileofs` (in etypes, relative to the
    /// displacement recorded by the preceding view), stored at `datalog_ofs` in the data log.
    fn write(&mut self, fileofs: i64, size: i32, datalog_ofs: i64) -> Result<bool, Error>;
    /// Called once after the last record, if any record was dispatched.
    fn done(&mut self) -> Result<(), Error>;
}

////////////////////////////////////////////// LogFile /////////////////////////////////////////////

/// The log-file engine.  Owns a two-channel store and appends typed records to it.
pub struct LogFile<S: LogStore + LogReader> {
    store: S,
    datalog_offset: u64,
    metalog_offset: u64,
    data_epoch_start: u64,
    meta_epoch_start: u64,
    last_epoch: i32,
    epoch: i32,
    active: bool,
    read_active: bool,
    dirty_view: bool,
    dirty_size: bool,
    dirty_sync: bool,
    filesize: i64,
    displacement: i64,
    etype: Typemap,
    ftype: Typemap,
    read_pos: u64,
}

impl<S: LogStore + LogReader> LogFile<S> {
    /// Create an engine over `store`.  Nothing touches the store until the first record write.
    pub fn new(store: S) -> Self {
        Self {
            store,
            datalog_offset: 0,
            metalog_offset: 0,
            data_epoch_start: 0,
            meta_epoch_start: 0,
            last_epoch: -1,
            epoch: 0,
            active: false,
            read_active: false,
            dirty_view: false,
            dirty_size: false,
            dirty_sync: false,
            filesize: 0,
            displacement: 0,
            etype: Typemap::byte(),
            ftype: Typemap::byte(),
            read_pos: 0,
        }
    }

    /// The underlying store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Tear the engine apart and hand the store back.
    pub fn into_store(self) -> S {
        self.store
    }

    /// The current epoch.
    pub fn epoch(&self) -> i32 {
        self.epoch
    }

    /// The most recently recorded filesize.
    pub fn filesize(&self) -> i64 {
        self.filesize
    }

    /// Install the epoch loaded from the superblock.  Collective:  every process must install the
    /// same value.
    pub fn set_epoch(&mut self, epoch: i32) {
        self.epoch = epoch;
        self.dirty_sync = true;
    }

    /// Record a view change.  Nothing is persisted until the next data record.
    pub fn record_view(&mut self, displacement: i64, etype: Typemap, ftype: Typemap) {
        self.displacement = displacement;
        self.etype = etype;
        self.ftype = ftype;
        self.dirty_view = true;
    }

    /// Record a filesize change.  Setting size zero starts the file over, epoch included.
    pub fn record_setsize(&mut self, size: i64) {
        self.filesize = size;
        if size == 0 {
            self.epoch = 0;
        }
        self.dirty_size = true;
    }

    /// Advance the epoch.  Collective.
    pub fn record_sync(&mut self) {
        self.epoch += 1;
        self.dirty_sync = true;
    }

    /// Append a DATA record carrying `buf`, destined for `offset` (in etypes, relative to the
    /// current displacement).  Returns the data-log offset where the payload begins.
    pub fn record_write(&mut self, buf: &[u8], offset: i64) -> Result<i64, Error> {
        RECORD_DATA.click();
        if self.dirty_view {
            self.flush_view()?;
        }
        if self.dirty_size {
            self.flush_size()?;
        }
        if self.dirty_sync {
            self.flush_sync()?;
        }
        self.record_header(RECORD_DATA_TAG)?;
        let mut body = Vec::with_capacity(4 + 8 + 8);
        body.extend_from_slice(&(buf.len() as i32).to_ne_bytes());
        body.extend_from_slice(&offset.to_ne_bytes());
        let dataofs = self.datalog_offset;
        body.extend_from_slice(&(dataofs as i64).to_ne_bytes());
        self.append(LogChannel::Meta, &body)?;
        self.append(LogChannel::Data, buf)?;
        if self.datalog_offset != dataofs + buf.len() as u64 {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                context: "data log did not advance by the payload size".to_string(),
            });
        }
        Ok(dataofs as i64)
    }

    /// Truncate the logs.  `last` rewinds only the current epoch, and only if the epoch was
    /// actually written to; otherwise the whole log is restarted with fresh headers.
    pub fn clear(&mut self, last: bool) -> Result<(), Error> {
        if !self.active {
            return Ok(());
        }
        if last {
            // If the last recorded epoch differs from the current epoch, nothing of the current
            // epoch ever hit the log.
            if self.epoch != self.last_epoch {
                return Ok(());
            }
            self.store.restart(LogChannel::Meta, self.meta_epoch_start)?;
            self.metalog_offset = self.meta_epoch_start;
            self.store.restart(LogChannel::Data, self.data_epoch_start)?;
            self.datalog_offset = self.data_epoch_start;
            return Ok(());
        }
        self.epoch = 0;
        self.last_epoch = -1;
        self.dirty_view = true;
        self.dirty_size = true;
        self.dirty_sync = true;
        self.store.restart(LogChannel::Meta, 0)?;
        self.metalog_offset = 0;
        self.store.restart(LogChannel::Data, 0)?;
        self.datalog_offset = 0;
        self.write_headers()
    }

    /// Replay the meta log through `sink`:  the whole log, or only the current epoch when `last`
    /// is set.  Returns Ok(false) if a callback stopped the replay early.
    pub fn replay<R: ReplaySink>(&mut self, last: bool, sink: &mut R) -> Result<bool, Error> {
        if last && (!self.active || self.epoch != self.last_epoch) {
            return Ok(true);
        }
        self.read_pos = if last { self.meta_epoch_start } else { 0 };
        if !self.read_active {
            self.read_active = true;
            self.store.reader_init()?;
        }
        let mut source = EngineSource {
            store: &mut self.store,
            pos: &mut self.read_pos,
        };
        replay_records(&mut source, sink, !last)
    }

    /// Flush the lazily recorded filesize, if any, and close the store.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.dirty_size {
            self.flush_size()?;
        }
        if self.read_active {
            self.read_active = false;
            self.store.reader_done()?;
        }
        if self.active {
            self.active = false;
            self.store.done()?;
        }
        Ok(())
    }

    //////////////////////////////////////////// writing ///////////////////////////////////////////

    fn open_logs(&mut self) -> Result<(), Error> {
        if self.active {
            return Ok(());
        }
        self.active = true;
        self.store.init()?;
        if !self.read_active {
            self.read_active = true;
            self.store.reader_init()?;
        }
        let mut header = [0u8; LOG_HEADER_SIZE];
        let got = self.store.read(LogChannel::Meta, 0, &mut header)?;
        if got == LOG_HEADER_SIZE && &header[..LOG_MAGIC.len()] == LOG_MAGIC {
            // Resuming an existing pair of logs; append at their ends.
            self.datalog_offset = self.store.size(LogChannel::Data)?;
            self.metalog_offset = self.store.size(LogChannel::Meta)?;
            Ok(())
        } else {
            self.store.restart(LogChannel::Meta, 0)?;
            self.metalog_offset = 0;
            self.store.restart(LogChannel::Data, 0)?;
            self.datalog_offset = 0;
            self.write_headers()
        }
    }

    fn append(&mut self, chan: LogChannel, data: &[u8]) -> Result<(), Error> {
        if !self.active {
            self.open_logs()?;
        }
        let ofs = match chan {
            LogChannel::Meta => self.metalog_offset,
            LogChannel::Data => self.datalog_offset,
        };
        self.store.write(chan, ofs, data)?;
        match chan {
            LogChannel::Meta => self.metalog_offset += data.len() as u64,
            LogChannel::Data => self.datalog_offset += data.len() as u64,
        }
        Ok(())
    }

    fn write_headers(&mut self) -> Result<(), Error> {
        let mut header = [0u8; LOG_HEADER_SIZE];
        header[..LOG_MAGIC.len()].copy_from_slice(LOG_MAGIC);
        self.append(LogChannel::Meta, &header)?;
        self.append(LogChannel::Data, &header)
    }

    fn record_header(&mut self, tag: i32) -> Result<(), Error> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[..4].copy_from_slice(&tag.to_ne_bytes());
        header[8..].copy_from_slice(&wall_clock_seconds().to_ne_bytes());
        self.append(LogChannel::Meta, &header)
    }

    fn flush_view(&mut self) -> Result<(), Error> {
        RECORD_VIEW_FLUSHED.click();
        self.record_header(RECORD_VIEW)?;
        let mut body = Vec::new();
        body.extend_from_slice(&self.displacement.to_ne_bytes());
        self.etype.encode(&mut body);
        self.ftype.encode(&mut body);
        self.append(LogChannel::Meta, &body)?;
        self.dirty_view = false;
        Ok(())
    }

    fn flush_size(&mut self) -> Result<(), Error> {
        RECORD_SIZE_FLUSHED.click();
        self.record_header(RECORD_SETSIZE)?;
        let body = self.filesize.to_ne_bytes();
        self.append(LogChannel::Meta, &body)?;
        self.dirty_size = false;
        Ok(())
    }

    fn flush_sync(&mut self) -> Result<(), Error> {
        RECORD_SYNC_FLUSHED.click();
        // The epoch starts at the SYNC record itself, so a rollback erases it too.
        self.data_epoch_start = self.datalog_offset;
        self.meta_epoch_start = self.metalog_offset;
        self.last_epoch = self.epoch;
        self.record_header(RECORD_SYNC)?;
        let body = self.epoch.to_ne_bytes();
        self.append(LogChannel::Meta, &body)?;
        self.dirty_sync = false;
        Ok(())
    }
}

////////////////////////////////////////// record reading //////////////////////////////////////////

// The byte source a replay pulls from.  One implementation reads through the engine's channel
// store, the other straight from a file on disk.
trait RecordSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

struct EngineSource<'a, S: LogStore + LogReader> {
    store: &'a mut S,
    pos: &'a mut u64,
}

impl<'a, S: LogStore + LogReader> RecordSource for EngineSource<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let got = self.store.read(LogChannel::Meta, *self.pos, buf)?;
        *self.pos += got as u64;
        Ok(got)
    }
}

struct FileSource {
    file: File,
    pos: u64,
}

impl RecordSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut total = 0;
        while total < buf.len() {
            let got = self.file.read_at(&mut buf[total..], self.pos)?;
            if got == 0 {
                break;
            }
            total += got;
            self.pos += got as u64;
        }
        Ok(total)
    }
}

fn corruption(what: &str) -> Error {
    Error::Corruption {
        core: ErrorCore::default(),
        what: what.to_string(),
    }
}

fn read_exactly(source: &mut dyn RecordSource, buf: &mut [u8]) -> Result<(), Error> {
    let got = source.read(buf)?;
    if got != buf.len() {
        return Err(corruption("meta log ends inside a record"));
    }
    Ok(())
}

fn read_i32(source: &mut dyn RecordSource) -> Result<i32, Error> {
    let mut buf = [0u8; 4];
    read_exactly(source, &mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

fn read_i64(source: &mut dyn RecordSource) -> Result<i64, Error> {
    let mut buf = [0u8; 8];
    read_exactly(source, &mut buf)?;
    Ok(i64::from_ne_bytes(buf))
}

fn read_typemap(source: &mut dyn RecordSource) -> Result<Typemap, Error> {
    let count = read_i64(source)?;
    if count < 0 || count > i32::MAX as i64 {
        return Err(corruption("typemap count out of range"));
    }
    let mut indices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        indices.push(read_i64(source)?);
    }
    let mut blocklens = Vec::with_capacity(count as usize);
    for _ in 0..count {
        blocklens.push(read_i64(source)?);
    }
    Ok(Typemap::from_parts(indices, blocklens))
}

fn replay_records<R: ReplaySink>(
    source: &mut dyn RecordSource,
    sink: &mut R,
    verify_header: bool,
) -> Result<bool, Error> {
    if verify_header {
        let mut header = [0u8; LOG_HEADER_SIZE];
        let got = source.read(&mut header)?;
        if got == 0 {
            return Ok(true);
        }
        if got != LOG_HEADER_SIZE || &header[..LOG_MAGIC.len()] != LOG_MAGIC {
            return Err(corruption("meta log header magic does not match"));
        }
    }
    let mut active = false;
    let mut cont = true;
    while cont {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let got = source.read(&mut header)?;
        if got == 0 {
            break;
        }
        if got != RECORD_HEADER_SIZE {
            return Err(corruption("meta log ends inside a record header"));
        }
        if !active {
            active = true;
            sink.init()?;
        }
        REPLAY_RECORDS.click();
        let tag = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        cont = match tag {
            RECORD_VIEW => {
                let displacement = read_i64(source)?;
                let etype = read_typemap(source)?;
                let ftype = read_typemap(source)?;
                sink.set_view(displacement, etype, ftype)?
            }
            RECORD_DATA_TAG => {
                let size = read_i32(source)?;
                let fileofs = read_i64(source)?;
                let datalog_ofs = read_i64(source)?;
                sink.write(fileofs, size, datalog_ofs)?
            }
            RECORD_SYNC => {
                let epoch = read_i32(source)?;
                sink.start_epoch(epoch)?
            }
            RECORD_SETSIZE => {
                let size = read_i64(source)?;
                sink.set_size(size)?
            }
            _ => {
                return Err(corruption("unknown record tag in meta log"));
            }
        };
    }
    if active {
        sink.done()?;
    }
    Ok(cont)
}

/// Walk the records of a meta log on disk, without an engine.  Used by tooling.
pub fn scan_meta_log<P: AsRef<Path>, R: ReplaySink>(path: P, sink: &mut R) -> Result<bool, Error> {
    let file = File::open(path.as_ref())?;
    let mut source = FileSource { file, pos: 0 };
    replay_records(&mut source, sink, true)
}

fn wall_clock_seconds() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(_) => 0.0,
    }
}

////////////////////////////////////////////// FileLog /////////////////////////////////////////////

/// A [RingOps] over a plain file.  Transfers complete eagerly; completion is still reported
/// through test and wait so the writering's accounting holds.
pub struct FileLog {
    path: PathBuf,
    file: Option<File>,
    pending_write: Option<u64>,
    pending_read: Option<u64>,
}

impl FileLog {
    /// A FileLog over the file at `path`.  The file is created on init.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            pending_write: None,
            pending_read: None,
        }
    }

    /// The path this log lives at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File, writering::Error> {
        match self.file.as_ref() {
            Some(file) => Ok(file),
            None => Err(writering::Error::LogicError {
                core: ErrorCore::default(),
                context: "file log used before init".to_string(),
            }),
        }
    }
}

impl RingOps for FileLog {
    fn init(&mut self, _read: bool, _write: bool) -> Result<(), writering::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    fn done(&mut self) -> Result<(), writering::Error> {
        self.file = None;
        Ok(())
    }

    fn start_write(&mut self, ofs: u64, data: &[u8]) -> Result<(), writering::Error> {
        self.file()?.write_all_at(data, ofs)?;
        self.pending_write = Some(data.len() as u64);
        Ok(())
    }

    fn test_write(&mut self) -> Result<Option<u64>, writering::Error> {
        Ok(self.pending_write.take())
    }

    fn wait_write(&mut self) -> Result<u64, writering::Error> {
        match self.pending_write.take() {
            Some(written) => Ok(written),
            None => Err(writering::Error::LogicError {
                core: ErrorCore::default(),
                context: "wait_write without a write outstanding".to_string(),
            }),
        }
    }

    fn start_read(&mut self, ofs: u64, data: &mut [u8]) -> Result<(), writering::Error> {
        let file = self.file()?;
        let mut total = 0;
        while total < data.len() {
            let got = file.read_at(&mut data[total..], ofs + total as u64)?;
            if got == 0 {
                break;
            }
            total += got;
        }
        self.pending_read = Some(total as u64);
        Ok(())
    }

    fn test_read(&mut self) -> Result<Option<u64>, writering::Error> {
        Ok(self.pending_read.take())
    }

    fn wait_read(&mut self) -> Result<u64, writering::Error> {
        match self.pending_read.take() {
            Some(got) => Ok(got),
            None => Err(writering::Error::LogicError {
                core: ErrorCore::default(),
                context: "wait_read without a read outstanding".to_string(),
            }),
        }
    }

    fn flush(&mut self) -> Result<(), writering::Error> {
        self.file()?.sync_data()?;
        Ok(())
    }

    fn reset(&mut self, size: u64) -> Result<(), writering::Error> {
        self.file()?.set_len(size)?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64, writering::Error> {
        Ok(self.file()?.metadata()?.len())
    }
}

///////////////////////////////////////////// RingStore ////////////////////////////////////////////

/// The production channel store:  one writering per log file.
pub struct RingStore {
    data: WriteRing<FileLog>,
    meta: WriteRing<FileLog>,
}

impl RingStore {
    /// Build a store from the two rings.
    pub fn new(data: WriteRing<FileLog>, meta: WriteRing<FileLog>) -> Self {
        Self { data, meta }
    }

    fn ring(&mut self, chan: LogChannel) -> &mut WriteRing<FileLog> {
        match chan {
            LogChannel::Data => &mut self.data,
            LogChannel::Meta => &mut self.meta,
        }
    }

    /// Flush both rings.
    pub fn flush_all(&mut self) -> Result<(), Error> {
        self.data.flush()?;
        self.meta.flush()?;
        Ok(())
    }

    /// Tick both rings.
    pub fn progress(&mut self) -> Result<(), Error> {
        self.data.progress()?;
        self.meta.progress()?;
        Ok(())
    }

    /// Turn sync mode on or off for both rings.
    pub fn set_sync(&mut self, sync: bool) -> Result<(), Error> {
        self.data.set_sync(sync)?;
        self.meta.set_sync(sync)?;
        Ok(())
    }

    /// Turn debug checking on or off for both rings.
    pub fn set_debug(&mut self, debug: bool) {
        self.data.set_debug(debug);
        self.meta.set_debug(debug);
    }
}

impl LogStore for RingStore {
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn write(&mut self, chan: LogChannel, ofs: u64, data: &[u8]) -> Result<(), Error> {
        Ok(self.ring(chan).write(ofs, data)?)
    }

    fn restart(&mut self, chan: LogChannel, ofs: u64) -> Result<(), Error> {
        Ok(self.ring(chan).reset(ofs)?)
    }

    fn size(&mut self, chan: LogChannel) -> Result<u64, Error> {
        Ok(self.ring(chan).size()?)
    }

    fn done(&mut self) -> Result<(), Error> {
        self.data.close()?;
        self.meta.close()?;
        Ok(())
    }
}

impl LogReader for RingStore {
    fn reader_init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn read(&mut self, chan: LogChannel, ofs: u64, data: &mut [u8]) -> Result<usize, Error> {
        Ok(self.ring(chan).read(ofs, data)?)
    }

    fn reader_done(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    // A channel store over two in-memory buffers.
    #[derive(Default)]
    struct MemStore {
        meta: Vec<u8>,
        data: Vec<u8>,
    }

    impl MemStore {
        fn buf(&mut self, chan: LogChannel) -> &mut Vec<u8> {
            match chan {
                LogChannel::Meta => &mut self.meta,
                LogChannel::Data => &mut self.data,
            }
        }
    }

    impl LogStore for MemStore {
        fn init(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn write(&mut self, chan: LogChannel, ofs: u64, data: &[u8]) -> Result<(), Error> {
            let buf = self.buf(chan);
            let ofs = ofs as usize;
            if buf.len() < ofs + data.len() {
                buf.resize(ofs + data.len(), 0);
            }
            buf[ofs..ofs + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn restart(&mut self, chan: LogChannel, ofs: u64) -> Result<(), Error> {
            self.buf(chan).truncate(ofs as usize);
            Ok(())
        }

        fn size(&mut self, chan: LogChannel) -> Result<u64, Error> {
            Ok(self.buf(chan).len() as u64)
        }

        fn done(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    impl LogReader for MemStore {
        fn reader_init(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn read(&mut self, chan: LogChannel, ofs: u64, data: &mut [u8]) -> Result<usize, Error> {
            let buf = self.buf(chan);
            let ofs = std::cmp::min(ofs as usize, buf.len());
            let avail = std::cmp::min(data.len(), buf.len() - ofs);
            data[..avail].copy_from_slice(&buf[ofs..ofs + avail]);
            Ok(avail)
        }

        fn reader_done(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[derive(Debug, Default, Eq, PartialEq)]
    struct Recorded {
        events: Vec<String>,
    }

    impl ReplaySink for Recorded {
        fn init(&mut self) -> Result<(), Error> {
            self.events.push("init".to_string());
            Ok(())
        }

        fn start_epoch(&mut self, epoch: i32) -> Result<bool, Error> {
            self.events.push(format!("epoch {}", epoch));
            Ok(true)
        }

        fn set_view(
            &mut self,
            displacement: i64,
            etype: Typemap,
            ftype: Typemap,
        ) -> Result<bool, Error> {
            self.events.push(format!(
                "view disp={} etype={} ftype={}",
                displacement,
                etype.count(),
                ftype.count()
            ));
            Ok(true)
        }

        fn set_size(&mut self, size: i64) -> Result<bool, Error> {
            self.events.push(format!("setsize {}", size));
            Ok(true)
        }

        fn write(&mut self, fileofs: i64, size: i32, datalog_ofs: i64) -> Result<bool, Error> {
            self.events
                .push(format!("write ofs={} size={} dlog={}", fileofs, size, datalog_ofs));
            Ok(true)
        }

        fn done(&mut self) -> Result<(), Error> {
            self.events.push("done".to_string());
            Ok(())
        }
    }

    #[test]
    fn data_records_carry_their_payload() {
        let mut log = LogFile::new(MemStore::default());
        let d0 = log.record_write(b"abcd", 0).unwrap();
        let d1 = log.record_write(b"efgh", 4).unwrap();
        assert_eq!(LOG_HEADER_SIZE as i64, d0);
        assert_eq!(LOG_HEADER_SIZE as i64 + 4, d1);
        assert_eq!(b"abcdefgh", &log.store_mut().data[LOG_HEADER_SIZE..]);
        assert_eq!(LOG_MAGIC, &log.store_mut().meta[..LOG_MAGIC.len()]);
    }

    #[test]
    fn dirty_flags_flush_in_order_before_data() {
        let mut log = LogFile::new(MemStore::default());
        log.record_view(128, Typemap::byte(), Typemap::strided(4, 8, 2));
        log.record_setsize(4096);
        log.record_sync();
        log.record_write(b"xy", 7).unwrap();
        let mut sink = Recorded::default();
        assert!(log.replay(false, &mut sink).unwrap());
        assert_eq!(
            vec![
                "init".to_string(),
                "view disp=128 etype=1 ftype=2".to_string(),
                "setsize 4096".to_string(),
                "epoch 1".to_string(),
                format!("write ofs=7 size=2 dlog={}", LOG_HEADER_SIZE),
                "done".to_string(),
            ],
            sink.events
        );
    }

    #[test]
    fn repeated_state_changes_collapse() {
        let mut log = LogFile::new(MemStore::default());
        log.record_setsize(100);
        log.record_setsize(200);
        log.record_setsize(300);
        log.record_write(b"z", 0).unwrap();
        let mut sink = Recorded::default();
        log.replay(false, &mut sink).unwrap();
        let sizes: Vec<&String> =
            sink.events.iter().filter(|e| e.starts_with("setsize")).collect();
        assert_eq!(1, sizes.len());
        assert_eq!("setsize 300", sizes[0].as_str());
    }

    #[test]
    fn replay_round_trips_every_record_kind() {
        let mut log = LogFile::new(MemStore::default());
        log.set_epoch(3);
        log.record_view(0, Typemap::byte(), Typemap::byte());
        log.record_write(b"one", 0).unwrap();
        log.record_sync();
        log.record_setsize(64);
        log.record_write(b"two", 32).unwrap();
        let mut sink = Recorded::default();
        assert!(log.replay(false, &mut sink).unwrap());
        assert_eq!(
            vec![
                "init".to_string(),
                "view disp=0 etype=1 ftype=1".to_string(),
                "epoch 3".to_string(),
                format!("write ofs=0 size=3 dlog={}", LOG_HEADER_SIZE),
                "setsize 64".to_string(),
                "epoch 4".to_string(),
                format!("write ofs=32 size=3 dlog={}", LOG_HEADER_SIZE + 3),
                "done".to_string(),
            ],
            sink.events
        );
    }

    #[test]
    fn epoch_rollback_erases_the_current_epoch() {
        // Write 1KiB, sync, write 512B, roll back the epoch:  replay sees only the first write.
        let mut log = LogFile::new(MemStore::default());
        let kib = vec![1u8; 1024];
        log.record_write(&kib, 0).unwrap();
        log.record_sync();
        let half = vec![2u8; 512];
        log.record_write(&half, 1024).unwrap();
        log.clear(true).unwrap();
        let mut sink = Recorded::default();
        assert!(log.replay(false, &mut sink).unwrap());
        assert_eq!(
            vec![
                "init".to_string(),
                format!("write ofs=0 size=1024 dlog={}", LOG_HEADER_SIZE),
                "done".to_string(),
            ],
            sink.events
        );
        assert_eq!(LOG_HEADER_SIZE + 1024, log.store_mut().data.len());
    }

    #[test]
    fn rollback_of_an_untouched_epoch_is_a_noop() {
        let mut log = LogFile::new(MemStore::default());
        log.record_write(b"data", 0).unwrap();
        log.record_sync();
        // The new epoch never reached the log, so there is nothing to roll back.
        log.clear(true).unwrap();
        let mut sink = Recorded::default();
        assert!(log.replay(false, &mut sink).unwrap());
        assert_eq!(
            vec![
                "init".to_string(),
                format!("write ofs=0 size=4 dlog={}", LOG_HEADER_SIZE),
                "done".to_string(),
            ],
            sink.events
        );
    }

    #[test]
    fn full_clear_restarts_the_log() {
        let mut log = LogFile::new(MemStore::default());
        log.record_write(b"gone", 0).unwrap();
        log.record_sync();
        log.clear(false).unwrap();
        assert_eq!(0, log.epoch());
        log.record_write(b"kept", 0).unwrap();
        let mut sink = Recorded::default();
        log.replay(false, &mut sink).unwrap();
        // The fresh log re-emits the view and the epoch before the first data record.
        assert_eq!(
            vec![
                "init".to_string(),
                "view disp=0 etype=1 ftype=1".to_string(),
                "setsize 0".to_string(),
                "epoch 0".to_string(),
                format!("write ofs=0 size=4 dlog={}", LOG_HEADER_SIZE),
                "done".to_string(),
            ],
            sink.events
        );
    }

    #[test]
    fn replay_of_an_empty_engine_dispatches_nothing() {
        let mut log = LogFile::new(MemStore::default());
        let mut sink = Recorded::default();
        assert!(log.replay(false, &mut sink).unwrap());
        assert!(sink.events.is_empty());
        assert!(log.replay(true, &mut sink).unwrap());
        assert!(sink.events.is_empty());
    }

    #[test]
    fn replay_abort() {
        struct StopAfterOne {
            seen: usize,
        }

        impl ReplaySink for StopAfterOne {
            fn init(&mut self) -> Result<(), Error> {
                Ok(())
            }
            fn start_epoch(&mut self, _: i32) -> Result<bool, Error> {
                self.seen += 1;
                Ok(self.seen < 1)
            }
            fn set_view(&mut self, _: i64, _: Typemap, _: Typemap) -> Result<bool, Error> {
                Ok(true)
            }
            fn set_size(&mut self, _: i64) -> Result<bool, Error> {
                Ok(true)
            }
            fn write(&mut self, _: i64, _: i32, _: i64) -> Result<bool, Error> {
                self.seen += 1;
                Ok(false)
            }
            fn done(&mut self) -> Result<(), Error> {
                Ok(())
            }
        }

        let mut log = LogFile::new(MemStore::default());
        log.record_write(b"a", 0).unwrap();
        log.record_write(b"b", 1).unwrap();
        let mut sink = StopAfterOne { seen: 0 };
        assert!(!log.replay(false, &mut sink).unwrap());
        assert_eq!(1, sink.seen);
    }

    #[test]
    fn unknown_record_tag_is_corruption() {
        let mut log = LogFile::new(MemStore::default());
        log.record_write(b"ok", 0).unwrap();
        // Scribble an unknown tag over the record header.
        let meta = &mut log.store_mut().meta;
        meta[LOG_HEADER_SIZE..LOG_HEADER_SIZE + 4].copy_from_slice(&99i32.to_ne_bytes());
        let mut sink = Recorded::default();
        match log.replay(false, &mut sink) {
            Err(Error::Corruption { .. }) => {}
            Ok(_) => panic!("replay should have failed"),
            Err(err) => panic!("wrong error: {:?}", err),
        }
    }

    #[test]
    fn truncated_record_is_corruption() {
        let mut log = LogFile::new(MemStore::default());
        log.record_write(b"payload", 0).unwrap();
        let len = log.store_mut().meta.len();
        log.store_mut().meta.truncate(len - 3);
        let mut sink = Recorded::default();
        match log.replay(false, &mut sink) {
            Err(Error::Corruption { .. }) => {}
            Ok(_) => panic!("replay should have failed"),
            Err(err) => panic!("wrong error: {:?}", err),
        }
    }

    #[test]
    fn bad_log_header_is_corruption() {
        let mut log = LogFile::new(MemStore::default());
        log.record_write(b"payload", 0).unwrap();
        log.store_mut().meta[0] = b'x';
        let mut sink = Recorded::default();
        match log.replay(false, &mut sink) {
            Err(Error::Corruption { .. }) => {}
            Ok(_) => panic!("replay should have failed"),
            Err(err) => panic!("wrong error: {:?}", err),
        }
    }

    #[test]
    fn resume_appends_after_existing_records() {
        let mut log = LogFile::new(MemStore::default());
        log.record_write(b"first", 0).unwrap();
        log.finish().unwrap();
        let store = log.into_store();
        let mut log = LogFile::new(store);
        log.record_write(b"second", 5).unwrap();
        let mut sink = Recorded::default();
        log.replay(false, &mut sink).unwrap();
        assert_eq!(
            vec![
                "init".to_string(),
                format!("write ofs=0 size=5 dlog={}", LOG_HEADER_SIZE),
                format!("write ofs=5 size=6 dlog={}", LOG_HEADER_SIZE + 5),
                "done".to_string(),
            ],
            sink.events
        );
    }
}
