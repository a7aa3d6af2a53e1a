/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Background find cache. One scan of the tree under the configured root is
//! kicked off at construction; the sorted results are published exactly once
//! and afterwards served lock-free to the `find`-style query families the
//! evaluator's builtins need. If the scan fails, queries report the cache as
//! unavailable and callers fall back to a live `find`.

use std::{
    collections::{HashSet, VecDeque},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, SyncSender, sync_channel},
    },
    time::Instant,
};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use memchr::{memchr, memchr_iter};
use parking_lot::Mutex;

use crate::{
    error,
    flags::FLAGS,
    log, log_stat,
    strutil::{basename, dirname, get_ext, normalize_path, trim_prefix},
    warn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Dir,
    Symlink,
    Other,
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_file() {
            FileKind::Regular
        } else if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: Bytes,
    pub kind: FileKind,
}

impl FileInfo {
    fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
    fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }
}

enum WalkAction {
    Continue,
    SkipDir,
}

pub struct FindCache {
    enabled: bool,
    files: OnceLock<Option<Arc<Vec<FileInfo>>>>,
    leaves: OnceLock<Option<Arc<Vec<FileInfo>>>>,
    files_rx: Mutex<Option<Receiver<Vec<FileInfo>>>>,
    leaves_rx: Mutex<Option<Receiver<Vec<FileInfo>>>>,
}

impl FindCache {
    pub fn new(enabled: bool, root: PathBuf, prunes: Vec<Bytes>, leaf_names: Vec<Bytes>) -> Self {
        let ret = Self {
            enabled,
            files: OnceLock::new(),
            leaves: OnceLock::new(),
            files_rx: Mutex::new(None),
            leaves_rx: Mutex::new(None),
        };
        if !enabled {
            return ret;
        }
        let (files_tx, files_rx) = sync_channel(1);
        let (leaves_tx, leaves_rx) = sync_channel(1);
        *ret.files_rx.lock() = Some(files_rx);
        *ret.leaves_rx.lock() = Some(leaves_rx);
        std::thread::spawn(move || scan(root, prunes, leaf_names, files_tx, leaves_tx));
        ret
    }

    /// Blocks until the scan has published its file list. None means the
    /// cache is disabled or the scan failed.
    fn files(&self) -> Option<Arc<Vec<FileInfo>>> {
        if !self.enabled {
            return None;
        }
        self.files
            .get_or_init(|| {
                let rx = self.files_rx.lock().take()?;
                rx.recv().ok().map(Arc::new)
            })
            .clone()
    }

    fn leaves(&self) -> Option<Arc<Vec<FileInfo>>> {
        if !self.enabled {
            return None;
        }
        self.leaves
            .get_or_init(|| {
                let rx = self.leaves_rx.lock().take()?;
                rx.recv().ok().map(Arc::new)
            })
            .clone()
    }

    fn walk<F>(&self, files: &[FileInfo], dir: &[u8], f: &mut F) -> Result<()>
    where
        F: FnMut(usize, &FileInfo) -> Result<WalkAction>,
    {
        let start = files.partition_point(|fi| fi.path.as_ref() < dir);
        log!(
            "find in dir cache: {} i={start}/{}",
            String::from_utf8_lossy(dir),
            files.len()
        );
        let mut dir_slash = BytesMut::with_capacity(dir.len() + 1);
        dir_slash.put_slice(dir);
        dir_slash.put_u8(b'/');
        let mut skipdirs: Vec<Bytes> = Vec::new();
        'entries: for i in start..files.len() {
            let fi = &files[i];
            if fi.path == dir {
                match f(i, fi)? {
                    WalkAction::SkipDir => return Ok(()),
                    WalkAction::Continue => {}
                }
                continue;
            }
            if !fi.path.starts_with(dir) {
                return Ok(());
            }
            if !fi.path.starts_with(&dir_slash) {
                continue;
            }
            for skip in &skipdirs {
                if fi.path.starts_with(skip) {
                    continue 'entries;
                }
            }

            match f(i, fi)? {
                WalkAction::SkipDir => {
                    log!("find in skip dir: {}", String::from_utf8_lossy(&fi.path));
                    let mut skip = BytesMut::with_capacity(fi.path.len() + 1);
                    skip.put_slice(&fi.path);
                    skip.put_u8(b'/');
                    skipdirs.push(skip.freeze());
                }
                WalkAction::Continue => {}
            }
        }
        Ok(())
    }

    /// `find ./ -not -name '.*' -and -type f -and -not -type l` under `dir`.
    pub fn find_in_dir(&self, dir: &[u8], out: &mut Vec<Bytes>) -> bool {
        let Some(files) = self.files() else {
            return false;
        };
        let dir = normalize_path(dir);
        let _ = self.walk(&files, &dir, &mut |_, fi| {
            if basename(&fi.path).starts_with(b".") {
                return Ok(WalkAction::Continue);
            }
            if !fi.is_regular() {
                return Ok(WalkAction::Continue);
            }
            out.push(relative_name(&fi.path, &dir, true));
            Ok(WalkAction::Continue)
        });
        true
    }

    /// `find -L $root -name "*$ext" -and -not -name ".*"` relative to
    /// `chdir`. Returns false when a symlink is seen anywhere under the
    /// walk; the caller has to run the real `find` to follow it.
    pub fn find_ext_files_under(
        &self,
        chdir: &[u8],
        root: &[u8],
        ext: &[u8],
        out: &mut Vec<Bytes>,
    ) -> bool {
        let Some(files) = self.files() else {
            return false;
        };
        let chdir = normalize_path(chdir);
        let dir = crate::strutil::concat_dir(&chdir, root);
        let mut matches = Vec::new();
        let r = self.walk(&files, &dir, &mut |i, fi| {
            if fi.kind == FileKind::Symlink {
                error!("symlink {}", String::from_utf8_lossy(&fi.path));
            }
            matches.push(i);
            Ok(WalkAction::Continue)
        });
        if r.is_err() {
            return false;
        }
        for i in matches {
            let fi = &files[i];
            if !fi.is_regular() {
                continue;
            }
            let base = basename(&fi.path);
            if get_ext(base) != Some(ext) {
                continue;
            }
            if base.starts_with(b".") {
                continue;
            }
            out.push(relative_name(&fi.path, &chdir, false));
        }
        true
    }

    /// `find . -type d -a -name ".svn" -prune -o -type f` with the java
    /// resource exclusion list.
    pub fn find_java_resource_file_group(&self, dir: &[u8], out: &mut Vec<Bytes>) -> bool {
        let Some(files) = self.files() else {
            return false;
        };
        let dir = normalize_path(dir);
        let _ = self.walk(&files, &dir, &mut |_, fi| {
            if fi.is_dir() && basename(&fi.path) == b".svn" {
                return Ok(WalkAction::SkipDir);
            }
            if !fi.is_regular() {
                return Ok(WalkAction::Continue);
            }
            let base = basename(&fi.path);
            if get_ext(base) == Some(&b".java"[..])
                || base == b"package.html"
                || base == b"overview.html"
                || (base.starts_with(b".") && base.ends_with(b".swp"))
                || base == b".DS_Store"
                || base.ends_with(b"~")
            {
                return Ok(WalkAction::Continue);
            }
            out.push(relative_name(&fi.path, &dir, true));
            Ok(WalkAction::Continue)
        });
        true
    }

    /// Breadth-first findleaves: for every directory at least `mindepth`
    /// below `dir`, emit the first leaf named `name` and stop descending
    /// into that directory.
    pub fn find_leaves(
        &self,
        dir: &[u8],
        name: &[u8],
        prunes: &[Bytes],
        mindepth: i32,
        out: &mut Vec<Bytes>,
    ) -> bool {
        let Some(leaves) = self.leaves() else {
            return false;
        };
        let mut found = Vec::new();
        let dir = normalize_path(dir);
        let topdepth = count_slashes(&dir) as i32;
        let mut dirs = VecDeque::new();
        dirs.push_back(dir);
        while let Some(d) = dirs.pop_front() {
            let d = normalize_path(&d);
            let dirp = if d.is_empty() {
                Bytes::new()
            } else {
                let mut b = BytesMut::with_capacity(d.len() + 1);
                b.put_slice(&d);
                b.put_u8(b'/');
                b.freeze()
            };
            let depth = count_slashes(&dirp) as i32;
            let start = leaves.partition_point(|fi| {
                let di = count_slashes(&fi.path) as i32;
                if di != depth {
                    return di < depth;
                }
                let diri = dir_with_slash(&fi.path);
                if diri != dirp {
                    return diri < dirp;
                }
                fi.path < dirp
            });
            log!(
                "findleaves dir={:?} i={start}/{}",
                String::from_utf8_lossy(&dirp),
                leaves.len()
            );

            for fi in &leaves[start..] {
                if dirp.is_empty() && memchr(b'/', &fi.path).is_some() {
                    break;
                }
                if !fi.path.starts_with(&dirp) {
                    break;
                }
                if (mindepth < 0 || depth >= topdepth + mindepth)
                    && !fi.is_dir()
                    && basename(&fi.path) == name
                {
                    let mut n = BytesMut::with_capacity(fi.path.len() + 2);
                    n.put_slice(b"./");
                    n.put_slice(&fi.path);
                    found.push(n.freeze());
                    // Found a leaf, stop scanning this directory.
                    break;
                }
                if fi.is_dir() && !prunes.iter().any(|p| p.as_ref() == basename(&fi.path)) {
                    dirs.push_back(fi.path.clone());
                }
            }
        }
        found.sort();
        out.extend(found);
        true
    }
}

fn count_slashes(s: &[u8]) -> usize {
    memchr_iter(b'/', s).count()
}

fn dir_with_slash(s: &[u8]) -> Bytes {
    let d = dirname(s);
    let mut b = BytesMut::with_capacity(d.len() + 1);
    b.put_slice(&d);
    b.put_u8(b'/');
    b.freeze()
}

fn relative_name(path: &[u8], dir: &[u8], dot_slash: bool) -> Bytes {
    let mut dir_slash = BytesMut::with_capacity(dir.len() + 1);
    dir_slash.put_slice(dir);
    dir_slash.put_u8(b'/');
    let name = trim_prefix(path, &dir_slash);
    let mut n = BytesMut::with_capacity(name.len() + 2);
    if dot_slash {
        n.put_slice(b"./");
    }
    n.put_slice(name);
    n.freeze()
}

fn scan(
    root: PathBuf,
    prunes: Vec<Bytes>,
    leaf_names: Vec<Bytes>,
    files_tx: SyncSender<Vec<FileInfo>>,
    leaves_tx: SyncSender<Vec<FileInfo>>,
) {
    log!("find cache init: prunes={prunes:?} leaf_names={leaf_names:?}");
    let start_time = Instant::now();

    // Dropping files_tx/leaves_tx without sending is how a failed scan is
    // observed: the rendezvous channels close and queries see no data.
    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("open {root:?} failed: {err:?}");
            return;
        }
    };
    let mut names = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => names.push(entry.file_name()),
            Err(err) => {
                warn!("readdir {root:?} failed: {err:?}");
                return;
            }
        }
    }

    let failed = Arc::new(AtomicBool::new(false));
    let (dirs_tx, dirs_rx) = sync_channel::<std::ffi::OsString>(32);
    let dirs_rx = Arc::new(Mutex::new(dirs_rx));
    let (file_tx, file_rx) = sync_channel::<FileInfo>(1000);
    let (leaf_tx, leaf_rx) = sync_channel::<FileInfo>(1000);

    let num_cpus = if FLAGS.num_cpus > 0 {
        FLAGS.num_cpus
    } else {
        std::thread::available_parallelism().map_or(1, |p| p.get())
    };
    let num_workers = num_cpus.saturating_sub(1).max(1);
    let mut workers = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let root = root.clone();
        let prunes = prunes.clone();
        let leaf_names = leaf_names.clone();
        let dirs_rx = dirs_rx.clone();
        let file_tx = file_tx.clone();
        let leaf_tx = leaf_tx.clone();
        let failed = failed.clone();
        workers.push(std::thread::spawn(move || {
            loop {
                let recv = { dirs_rx.lock().recv() };
                let Ok(name) = recv else {
                    break;
                };
                let rel = Bytes::from(name.as_bytes().to_vec());
                if let Err(err) = walk_dir(
                    &root.join(&name),
                    rel,
                    &prunes,
                    &leaf_names,
                    &file_tx,
                    &leaf_tx,
                ) {
                    log!("error in find cache scan: {err:?}");
                    failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }));
    }
    drop(file_tx);
    drop(leaf_tx);

    let files_failed = failed.clone();
    let files_aggregator = std::thread::spawn(move || {
        let mut files = Vec::new();
        for fi in file_rx {
            files.push(fi);
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        if !files_failed.load(Ordering::SeqCst) {
            log_stat!("{} files in find cache", files.len());
            let _ = files_tx.send(files);
        }
    });

    let leaves_failed = failed.clone();
    let leaves_aggregator = std::thread::spawn(move || {
        let mut dirs = HashSet::new();
        let mut leaves = Vec::new();
        let mut nfiles = 0usize;
        for leaf in leaf_rx {
            nfiles += 1;
            // Record every ancestor directory of the leaf so the
            // breadth-first query can descend without the full file list.
            let mut dir = dirname(&leaf.path);
            leaves.push(leaf);
            while dir.as_ref() != b"." {
                if !dirs.insert(dir.clone()) {
                    break;
                }
                leaves.push(FileInfo {
                    path: dir.clone(),
                    kind: FileKind::Dir,
                });
                dir = dirname(&dir);
            }
        }
        leaves.sort_by(leaf_order);
        if !leaves_failed.load(Ordering::SeqCst) {
            log_stat!("{} leaves {} dirs in find cache", nfiles, dirs.len());
            let _ = leaves_tx.send(leaves);
        }
    });

    for name in names {
        if dirs_tx.send(name).is_err() {
            break;
        }
    }
    drop(dirs_tx);
    for w in workers {
        let _ = w.join();
    }
    let _ = files_aggregator.join();
    let _ = leaves_aggregator.join();
    log_stat!("find cache scan: {:?}", start_time.elapsed());
}

fn leaf_order(a: &FileInfo, b: &FileInfo) -> std::cmp::Ordering {
    let da = count_slashes(&a.path);
    let db = count_slashes(&b.path);
    if da != db {
        return da.cmp(&db);
    }
    let dira = dir_with_slash(&a.path);
    let dirb = dir_with_slash(&b.path);
    if dira != dirb {
        return dira.cmp(&dirb);
    }
    if a.is_dir() != b.is_dir() {
        return a.is_dir().cmp(&b.is_dir());
    }
    a.path.cmp(&b.path)
}

fn walk_dir(
    abs: &Path,
    rel: Bytes,
    prunes: &[Bytes],
    leaf_names: &[Bytes],
    file_tx: &SyncSender<FileInfo>,
    leaf_tx: &SyncSender<FileInfo>,
) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(abs)?;
    let kind = FileKind::from(meta.file_type());
    let base = basename(&rel);
    if kind == FileKind::Dir && prunes.iter().any(|p| p.as_ref() == base) {
        log!("find cache prune: {}", String::from_utf8_lossy(&rel));
        return Ok(());
    }
    let _ = file_tx.send(FileInfo {
        path: rel.clone(),
        kind,
    });
    if leaf_names.iter().any(|l| l.as_ref() == base) {
        log!("find cache leaf: {}", String::from_utf8_lossy(&rel));
        let _ = leaf_tx.send(FileInfo {
            path: rel.clone(),
            kind,
        });
    }
    if kind != FileKind::Dir {
        return Ok(());
    }
    for entry in std::fs::read_dir(abs)? {
        let entry = entry?;
        let name = entry.file_name();
        let mut sub = BytesMut::with_capacity(rel.len() + name.len() + 1);
        sub.put_slice(&rel);
        sub.put_u8(b'/');
        sub.put_slice(name.as_bytes());
        walk_dir(
            &abs.join(&name),
            sub.freeze(),
            prunes,
            leaf_names,
            file_tx,
            leaf_tx,
        )?;
    }
    Ok(())
}
