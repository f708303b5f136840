//! Virtual file system.
//!
//! Content is looked up through an ordered list of search paths: plain
//! directories and `.pak` archives. Paths added later take precedence, so a
//! mod directory shadows the base game and `pak1.pak` shadows `pak0.pak`.
//!
//! Archive file handles are opened lazily and closed again by
//! [`Vfs::reap_idle`] once they have been unused for a while.

use bytes::Buf;
use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::error::LoadError;

pub const PACK_IDENT: &[u8; 4] = b"PACK";
pub const PACK_ENTRY_SIZE: usize = 64;
const PACK_NAME_LEN: usize = 56;
pub const MAX_FILES_IN_PACK: usize = 2048;

/// Location of one file inside an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackEntry {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug)]
struct OpenHandle {
    file: File,
    last_used: Instant,
}

#[derive(Debug)]
pub struct Pack {
    path: PathBuf,
    entries: HashMap<String, PackEntry>,
    handle: Mutex<Option<OpenHandle>>,
}

impl Pack {
    /// Reads an archive directory.
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let name = path.display().to_string();
        let io_err = |source| LoadError::Io {
            name: name.clone(),
            source,
        };
        let mut file = File::open(path).map_err(io_err)?;
        let mut header = [0u8; 12];
        file.read_exact(&mut header).map_err(io_err)?;
        let mut h = &header[..];
        let magic = h.get_u32_le();
        if magic != u32::from_le_bytes(*PACK_IDENT) {
            return Err(LoadError::BadMagic {
                name: name.clone(),
                found: magic,
            });
        }
        let dir_offset = h.get_i32_le();
        let dir_length = h.get_i32_le();
        let file_len = file.metadata().map_err(io_err)?.len();
        if dir_offset < 0
            || dir_length < 0
            || dir_length as usize % PACK_ENTRY_SIZE != 0
            || dir_offset as u64 + dir_length as u64 > file_len
        {
            return Err(LoadError::LumpOutOfBounds {
                name: name.clone(),
                what: "pack directory",
                offset: dir_offset as i64,
                length: dir_length as i64,
                file_len: file_len as usize,
            });
        }
        let count = dir_length as usize / PACK_ENTRY_SIZE;
        if count > MAX_FILES_IN_PACK {
            return Err(LoadError::Malformed {
                name: name.clone(),
                reason: format!("{count} files exceeds {MAX_FILES_IN_PACK}"),
            });
        }

        let mut dir = vec![0u8; dir_length as usize];
        file.seek(SeekFrom::Start(dir_offset as u64)).map_err(io_err)?;
        file.read_exact(&mut dir).map_err(io_err)?;
        let entries = parse_pack_directory(&name, &dir, file_len)?;
        info!(pack = %name, files = entries.len(), "added pack");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            handle: Mutex::new(Some(OpenHandle {
                file,
                last_used: Instant::now(),
            })),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn read(&self, name: &str, entry: PackEntry) -> Result<Vec<u8>, LoadError> {
        let io_err = |source| LoadError::Io {
            name: name.to_string(),
            source,
        };
        let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            debug!(pack = %self.path.display(), "reopening pack");
            *guard = Some(OpenHandle {
                file: File::open(&self.path).map_err(io_err)?,
                last_used: Instant::now(),
            });
        }
        let h = guard.as_mut().ok_or_else(|| LoadError::NotFound {
            name: name.to_string(),
        })?;
        h.last_used = Instant::now();
        let mut buf = vec![0u8; entry.length as usize];
        h.file.seek(SeekFrom::Start(entry.offset)).map_err(io_err)?;
        h.file.read_exact(&mut buf).map_err(io_err)?;
        Ok(buf)
    }

    /// Closes the archive handle if unused since `now - idle`.
    fn reap(&self, now: Instant, idle: Duration) -> bool {
        let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(h) if now.saturating_duration_since(h.last_used) >= idle => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    fn is_open(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Decodes 64-byte directory records: NUL-padded name, offset, length.
pub fn parse_pack_directory(
    name: &str,
    dir: &[u8],
    file_len: u64,
) -> Result<HashMap<String, PackEntry>, LoadError> {
    let mut entries = HashMap::new();
    for mut rec in dir.chunks_exact(PACK_ENTRY_SIZE) {
        let raw = &rec[..PACK_NAME_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(PACK_NAME_LEN);
        let file_name = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
        rec.advance(PACK_NAME_LEN);
        let offset = rec.get_i32_le();
        let length = rec.get_i32_le();
        if offset < 0 || length < 0 || offset as u64 + length as u64 > file_len {
            return Err(LoadError::LumpOutOfBounds {
                name: name.to_string(),
                what: "pack entry",
                offset: offset as i64,
                length: length as i64,
                file_len: file_len as usize,
            });
        }
        entries.insert(
            file_name,
            PackEntry {
                offset: offset as u64,
                length: length as u64,
            },
        );
    }
    Ok(entries)
}

#[derive(Debug)]
enum SearchPath {
    Dir(PathBuf),
    Pack(Pack),
}

/// Layered content lookup.
#[derive(Debug, Default)]
pub struct Vfs {
    /// In priority order, lowest first.
    paths: Vec<SearchPath>,
}

impl Vfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_directory(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        info!(dir = %dir.display(), "added search directory");
        self.paths.push(SearchPath::Dir(dir));
    }

    pub fn add_pack(&mut self, path: &Path) -> Result<(), LoadError> {
        let pack = Pack::open(path)?;
        self.paths.push(SearchPath::Pack(pack));
        Ok(())
    }

    /// Adds a game directory followed by its `pak0.pak`, `pak1.pak`, ...
    pub fn add_game_directory(&mut self, dir: &Path) -> Result<(), LoadError> {
        self.add_directory(dir);
        for i in 0.. {
            let pak = dir.join(format!("pak{i}.pak"));
            if !pak.is_file() {
                break;
            }
            self.add_pack(&pak)?;
        }
        Ok(())
    }

    /// Reads a whole file, searching from the highest-priority path down.
    pub fn open_read(&self, name: &str) -> Result<Vec<u8>, LoadError> {
        let key = name.to_ascii_lowercase();
        for path in self.paths.iter().rev() {
            match path {
                SearchPath::Pack(pack) => {
                    if let Some(&entry) = pack.entries.get(&key) {
                        debug!(file = name, pack = %pack.path.display(), "found in pack");
                        return pack.read(name, entry);
                    }
                }
                SearchPath::Dir(dir) => {
                    let full = dir.join(name);
                    if full.is_file() {
                        debug!(file = %full.display(), "found in directory");
                        return fs::read(&full).map_err(|source| LoadError::Io {
                            name: name.to_string(),
                            source,
                        });
                    }
                }
            }
        }
        Err(LoadError::NotFound {
            name: name.to_string(),
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.paths.iter().any(|p| match p {
            SearchPath::Pack(pack) => pack.contains(&key),
            SearchPath::Dir(dir) => dir.join(name).is_file(),
        })
    }

    /// Writes a file into the highest-priority directory.
    pub fn open_write(&self, name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
        use anyhow::Context;

        let dir = self
            .paths
            .iter()
            .rev()
            .find_map(|p| match p {
                SearchPath::Dir(d) => Some(d),
                SearchPath::Pack(_) => None,
            })
            .context("no writable search directory")?;
        let full = dir.join(name);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut f = File::create(&full).with_context(|| format!("create {}", full.display()))?;
        f.write_all(data)
            .with_context(|| format!("write {}", full.display()))?;
        Ok(full)
    }

    /// Lists file names matching a `*` wildcard pattern, sorted and unique.
    pub fn search(&self, pattern: &str) -> Vec<String> {
        let pattern = pattern.to_ascii_lowercase();
        let mut found = BTreeSet::new();
        for path in &self.paths {
            match path {
                SearchPath::Pack(pack) => {
                    found.extend(
                        pack.entries
                            .keys()
                            .filter(|n| wildcard_match(&pattern, n))
                            .cloned(),
                    );
                }
                SearchPath::Dir(dir) => collect_dir(dir, dir, &pattern, &mut found),
            }
        }
        found.into_iter().collect()
    }

    /// Closes archive handles idle for at least `idle`; returns how many.
    pub fn reap_idle(&self, now: Instant, idle: Duration) -> usize {
        let closed = self
            .paths
            .iter()
            .filter(|p| matches!(p, SearchPath::Pack(pack) if pack.reap(now, idle)))
            .count();
        if closed > 0 {
            debug!(closed, "closed idle pack handles");
        }
        closed
    }

    pub fn open_handles(&self) -> usize {
        self.paths
            .iter()
            .filter(|p| matches!(p, SearchPath::Pack(pack) if pack.is_open()))
            .count()
    }
}

fn collect_dir(root: &Path, dir: &Path, pattern: &str, out: &mut BTreeSet<String>) {
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    for entry in rd.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_dir(root, &path, pattern, out);
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/").to_ascii_lowercase();
        if wildcard_match(pattern, &rel) {
            out.insert(rel);
        }
    }
}

/// Matches `*` against any run of characters.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("quake_vfs_{tag}_{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn build_pack(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        let mut dir = Vec::new();
        let mut offset = 12;
        for (name, data) in files {
            body.extend_from_slice(data);
            let mut rec = [0u8; PACK_ENTRY_SIZE];
            rec[..name.len()].copy_from_slice(name.as_bytes());
            (&mut rec[PACK_NAME_LEN..]).put_i32_le(offset as i32);
            (&mut rec[PACK_NAME_LEN + 4..]).put_i32_le(data.len() as i32);
            dir.extend_from_slice(&rec);
            offset += data.len();
        }
        let mut out = Vec::new();
        out.put_slice(PACK_IDENT);
        out.put_i32_le(offset as i32);
        out.put_i32_le(dir.len() as i32);
        out.extend_from_slice(&body);
        out.extend_from_slice(&dir);
        out
    }

    #[test]
    fn later_paths_shadow_earlier_ones() {
        let base = temp_dir("shadow");
        fs::write(
            base.join("pak0.pak"),
            build_pack(&[("maps/start.bsp", b"base"), ("gfx.wad", b"wad")]),
        )
        .unwrap();
        fs::write(base.join("pak1.pak"), build_pack(&[("maps/start.bsp", b"patched")])).unwrap();

        let mut vfs = Vfs::new();
        vfs.add_game_directory(&base).unwrap();
        assert_eq!(vfs.open_read("maps/start.bsp").unwrap(), b"patched");
        assert_eq!(vfs.open_read("GFX.WAD").unwrap(), b"wad");

        fs::create_dir_all(base.join("maps")).unwrap();
        fs::write(base.join("maps/start.bsp"), b"loose").unwrap();
        let mut vfs = Vfs::new();
        vfs.add_game_directory(&base).unwrap();
        vfs.add_directory(&base);
        assert_eq!(vfs.open_read("maps/start.bsp").unwrap(), b"loose");

        assert!(matches!(
            vfs.open_read("maps/e1m1.bsp"),
            Err(LoadError::NotFound { .. })
        ));
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn search_lists_unique_matches() {
        let base = temp_dir("search");
        fs::write(
            base.join("pak0.pak"),
            build_pack(&[("maps/e1m1.bsp", b"1"), ("maps/e1m2.bsp", b"2"), ("progs/player.mdl", b"3")]),
        )
        .unwrap();
        let mut vfs = Vfs::new();
        vfs.add_game_directory(&base).unwrap();
        vfs.open_write("maps/e1m1.bsp", b"mine").unwrap();
        assert_eq!(vfs.search("maps/*.bsp"), vec!["maps/e1m1.bsp", "maps/e1m2.bsp"]);
        assert_eq!(vfs.open_read("maps/e1m1.bsp").unwrap(), b"1");
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn idle_handles_are_reaped_and_reopened() {
        let base = temp_dir("reap");
        fs::write(base.join("pak0.pak"), build_pack(&[("a.txt", b"alpha")])).unwrap();
        let mut vfs = Vfs::new();
        vfs.add_game_directory(&base).unwrap();
        assert_eq!(vfs.open_handles(), 1);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(vfs.reap_idle(later, Duration::from_secs(60)), 1);
        assert_eq!(vfs.open_handles(), 0);
        assert_eq!(vfs.open_read("a.txt").unwrap(), b"alpha");
        assert_eq!(vfs.open_handles(), 1);
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn bad_pack_magic_is_rejected() {
        let base = temp_dir("magic");
        let path = base.join("pak0.pak");
        fs::write(&path, b"WAD2\0\0\0\0\0\0\0\0").unwrap();
        assert!(matches!(Pack::open(&path), Err(LoadError::BadMagic { .. })));
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*.bsp", "maps/e1m1.bsp"));
        assert!(wildcard_match("maps/e1m*", "maps/e1m8.bsp"));
        assert!(!wildcard_match("*.mdl", "maps/e1m1.bsp"));
        assert!(wildcard_match("*", ""));
    }
}
