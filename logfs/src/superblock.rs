//! The superblock is the one persistent object the whole group shares:  rank zero owns it, writes
//! it on every state transition, and broadcasts it on activate.  The lockfile next to it is a
//! zero-byte sentinel whose presence means the file is open somewhere.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use biometrics::{Collector, Counter};

use tatl::{HeyListen, Stationary};

use zerror_core::ErrorCore;

use crate::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static LOCK_OBTAINED: Counter = Counter::new("logfs.lock_obtained");

static LOCK_NOT_OBTAINED: Counter = Counter::new("logfs.lock_not_obtained");
static LOCK_NOT_OBTAINED_MONITOR: Stationary =
    Stationary::new("logfs.lock_not_obtained", &LOCK_NOT_OBTAINED);

/// Register the biometrics for the superblock and lockfile.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&LOCK_OBTAINED);
    collector.register_counter(&LOCK_NOT_OBTAINED);
}

/// Register the monitors for the superblock and lockfile.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&LOCK_NOT_OBTAINED_MONITOR);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The superblock magic, zero-padded to 64 bytes on disk.
pub const SUPERBLOCK_MAGIC: &[u8; 16] = b"logfs-logfsfile\n";
const MAGIC_SIZE: usize = 64;
const BASE_SIZE: usize = 255;
/// The encoded superblock size:  magic, flags, logfile count, epoch, logfile base.
pub const SUPERBLOCK_SIZE: usize = MAGIC_SIZE + 4 + 4 + 4 + BASE_SIZE;

/// The group is mid-replay.
pub const MODE_REPLAY: i32 = 2;
/// The file is open with active logging.
pub const MODE_ACTIVE: i32 = 3;

//////////////////////////////////////////// Superblock ////////////////////////////////////////////

/// The on-disk superblock for one logfs file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Superblock {
    /// One of [MODE_REPLAY], [MODE_ACTIVE], or zero for closed.
    pub flags: i32,
    /// The number of per-rank log files, fixed at creation.
    pub logfile_count: i32,
    /// The next epoch number, carried across reopens.
    pub epoch: i32,
    /// The base path the per-rank log files hang off of.
    pub logfile_base: String,
}

impl Superblock {
    /// Encode to the on-disk layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        buf[..SUPERBLOCK_MAGIC.len()].copy_from_slice(SUPERBLOCK_MAGIC);
        buf[MAGIC_SIZE..MAGIC_SIZE + 4].copy_from_slice(&self.flags.to_ne_bytes());
        buf[MAGIC_SIZE + 4..MAGIC_SIZE + 8].copy_from_slice(&self.logfile_count.to_ne_bytes());
        buf[MAGIC_SIZE + 8..MAGIC_SIZE + 12].copy_from_slice(&self.epoch.to_ne_bytes());
        let base = self.logfile_base.as_bytes();
        let base = &base[..std::cmp::min(base.len(), BASE_SIZE - 1)];
        buf[MAGIC_SIZE + 12..MAGIC_SIZE + 12 + base.len()].copy_from_slice(base);
        buf
    }

    /// Decode from the on-disk layout, checking the magic.
    pub fn decode(buf: &[u8]) -> Result<Superblock, Error> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(Error::Corruption {
                core: ErrorCore::default(),
                what: "superblock is short".to_string(),
            });
        }
        if &buf[..SUPERBLOCK_MAGIC.len()] != SUPERBLOCK_MAGIC {
            return Err(Error::Corruption {
                core: ErrorCore::default(),
                what: "superblock magic does not match".to_string(),
            });
        }
        let flags = i32::from_ne_bytes([buf[64], buf[65], buf[66], buf[67]]);
        let logfile_count = i32::from_ne_bytes([buf[68], buf[69], buf[70], buf[71]]);
        let epoch = i32::from_ne_bytes([buf[72], buf[73], buf[74], buf[75]]);
        let base = &buf[MAGIC_SIZE + 12..SUPERBLOCK_SIZE];
        let nul = base.iter().position(|b| *b == 0).unwrap_or(base.len());
        let logfile_base = String::from_utf8_lossy(&base[..nul]).to_string();
        Ok(Superblock {
            flags,
            logfile_count,
            epoch,
            logfile_base,
        })
    }

    /// Read the superblock at `path`.  Ok(None) when the file does not exist; a present file with
    /// a bad magic or short contents is corruption.
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Option<Superblock>, Error> {
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => {
                return Err(err.into());
            }
        };
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        let mut total = 0;
        while total < buf.len() {
            let got = file.read_at(&mut buf[total..], total as u64)?;
            if got == 0 {
                break;
            }
            total += got;
        }
        Self::decode(&buf[..total]).map(Some)
    }

    /// Rewrite the superblock through an open handle.
    pub fn store(&self, file: &File) -> Result<(), Error> {
        file.write_all_at(&self.encode(), 0)?;
        Ok(())
    }

    /// Remove the superblock at `path`.  Missing files are tolerated.
    pub fn remove<P: AsRef<Path>>(path: P) -> Result<(), Error> {
        match std::fs::remove_file(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Open (or create) the superblock file for rewriting.  Replay-on-close may need to read it back,
/// so it cannot be opened write-only.
pub fn open_superblock<P: AsRef<Path>>(path: P) -> Result<File, Error> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path.as_ref())?)
}

/////////////////////////////////////////// SentinelLock ///////////////////////////////////////////

/// Whole-file advisory exclusion.  The lock is the file's existence:  exclusive creation takes
/// it, removal releases it.  A crash leaves a stale lockfile behind for the operator to remove.
pub struct SentinelLock {
    path: PathBuf,
    armed: bool,
}

impl SentinelLock {
    /// Try to take the lock.  Ok(None) means somebody else holds it.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Option<SentinelLock>, Error> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())
        {
            Ok(_) => {
                LOCK_OBTAINED.click();
                Ok(Some(SentinelLock {
                    path: path.as_ref().to_path_buf(),
                    armed: true,
                }))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                LOCK_NOT_OBTAINED.click();
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Release the lock by deleting the sentinel.
    pub fn release(mut self) -> Result<(), Error> {
        self.armed = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// True iff a lockfile exists at `path`.
    pub fn is_locked<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().exists()
    }
}

impl Drop for SentinelLock {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::fs::remove_dir_all;

    use super::*;

    fn test_root(root: &str, line: u32) -> PathBuf {
        let root: String = root
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = PathBuf::from(format!("{}_{}", root, line));
        if path.exists() {
            remove_dir_all(&path).expect("could not prepare for test");
        }
        std::fs::create_dir(&path).expect("could not create test root");
        path
    }

    #[test]
    fn encode_decode() {
        let sb = Superblock {
            flags: MODE_ACTIVE,
            logfile_count: 4,
            epoch: 7,
            logfile_base: "/tmp/foo".to_string(),
        };
        let buf = sb.encode();
        assert_eq!(SUPERBLOCK_SIZE, buf.len());
        assert_eq!(sb, Superblock::decode(&buf).unwrap());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = Superblock::default().encode();
        buf[0] = b'x';
        if let Err(Error::Corruption { .. }) = Superblock::decode(&buf) {
        } else {
            panic!("bad case");
        }
    }

    #[test]
    fn read_from_missing_file() {
        let root = test_root(module_path!(), line!());
        assert_eq!(None, Superblock::read_from(root.join("nope.logfs")).unwrap());
    }

    #[test]
    fn store_and_read_back() {
        let root = test_root(module_path!(), line!());
        let path = root.join("file.logfs");
        let sb = Superblock {
            flags: MODE_REPLAY,
            logfile_count: 2,
            epoch: 1,
            logfile_base: "base".to_string(),
        };
        let file = open_superblock(&path).unwrap();
        sb.store(&file).unwrap();
        assert_eq!(Some(sb), Superblock::read_from(&path).unwrap());
        Superblock::remove(&path).unwrap();
        assert_eq!(None, Superblock::read_from(&path).unwrap());
        Superblock::remove(&path).unwrap();
    }

    #[test]
    fn lock_excludes_and_releases() {
        let root = test_root(module_path!(), line!());
        let path = root.join("file.logfslock");
        let lock = SentinelLock::acquire(&path).unwrap().unwrap();
        assert!(SentinelLock::is_locked(&path));
        assert!(SentinelLock::acquire(&path).unwrap().is_none());
        lock.release().unwrap();
        assert!(!SentinelLock::is_locked(&path));
        let again = SentinelLock::acquire(&path).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn dropping_the_lock_releases_it() {
        let root = test_root(module_path!(), line!());
        let path = root.join("file.logfslock");
        {
            let _lock = SentinelLock::acquire(&path).unwrap().unwrap();
            assert!(SentinelLock::is_locked(&path));
        }
        assert!(!SentinelLock::is_locked(&path));
    }
}
