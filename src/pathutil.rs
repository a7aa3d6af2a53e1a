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

//! Filesystem queries used while building the graph: existence checks for
//! implicit-rule probing, cached `wildcard` expansion, and the background
//! find cache. All of the cache state lives in a [`PathCache`] value owned
//! by the caller, so independent builders (and parallel tests) don't share
//! globals.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use memchr::{memchr3, memmem};
use parking_lot::Mutex;

use crate::{
    fileutil::{RedirectStderr, exists, libc_glob, run_command},
    find::FindCache,
    flags::FLAGS,
    log,
    strutil::{normalize_path, trim_prefix, word_scanner},
};

pub struct PathConfig {
    pub use_wildcard_cache: bool,
    pub use_find_cache: bool,
    pub find_cache_prunes: Vec<Bytes>,
    pub find_cache_leaf_names: Vec<Bytes>,
    /// Directory the find cache scans. `.` outside of tests.
    pub root: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            use_wildcard_cache: false,
            use_find_cache: false,
            find_cache_prunes: Vec::new(),
            find_cache_leaf_names: Vec::new(),
            root: PathBuf::from("."),
        }
    }
}

impl PathConfig {
    pub fn from_flags() -> Self {
        use std::os::unix::ffi::OsStrExt;
        Self {
            use_wildcard_cache: FLAGS.use_wildcard_cache,
            use_find_cache: FLAGS.use_find_cache,
            find_cache_prunes: FLAGS
                .find_cache_prunes
                .iter()
                .map(|s| Bytes::from(s.as_bytes().to_vec()))
                .collect(),
            find_cache_leaf_names: FLAGS
                .find_cache_leaf_names
                .iter()
                .map(|s| Bytes::from(s.as_bytes().to_vec()))
                .collect(),
            root: PathBuf::from("."),
        }
    }
}

pub struct PathCache {
    use_wildcard_cache: bool,
    wildcard_cache: Mutex<HashMap<Bytes, Arc<Vec<Bytes>>>>,
    find_cache: FindCache,
}

impl PathCache {
    pub fn new(config: PathConfig) -> Self {
        Self {
            use_wildcard_cache: config.use_wildcard_cache,
            wildcard_cache: Mutex::new(HashMap::new()),
            find_cache: FindCache::new(
                config.use_find_cache,
                config.root,
                config.find_cache_prunes,
                config.find_cache_leaf_names,
            ),
        }
    }

    pub fn exists(&self, path: &[u8]) -> bool {
        exists(path)
    }

    pub fn find_cache(&self) -> &FindCache {
        &self.find_cache
    }

    /// Expands a shell glob. Glob and stat failures surface as "no matches";
    /// missing files are normal while probing for applicable rules.
    pub fn wildcard(&self, pat: &Bytes) -> Arc<Vec<Bytes>> {
        if self.use_wildcard_cache {
            let cache = self.wildcard_cache.lock();
            if let Some(files) = cache.get(pat) {
                return files.clone();
            }
        }
        let files = Arc::new(wildcard_glob(pat).unwrap_or_default());
        if self.use_wildcard_cache {
            let mut cache = self.wildcard_cache.lock();
            cache.insert(pat.clone(), files.clone());
        }
        files
    }
}

/// Keeps `\*` `\?` `\[` `\\` escapes intact and drops any other backslash.
fn wildcard_unescape(pat: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(pat.len());
    let mut i = 0;
    while i < pat.len() {
        if pat[i] == b'\\' && i + 1 < pat.len() {
            let c = pat[i + 1];
            if matches!(c, b'*' | b'?' | b'[' | b'\\') {
                buf.put_u8(b'\\');
            }
            buf.put_u8(c);
            i += 2;
        } else {
            buf.put_u8(pat[i]);
            i += 1;
        }
    }
    buf.freeze()
}

fn first_meta(s: &[u8]) -> Option<usize> {
    memchr3(b'*', b'?', b'[', s)
}

fn wildcard_glob(pat: &Bytes) -> Result<Vec<Bytes>> {
    let pat = wildcard_unescape(pat);
    let pattern = normalize_path(&pat);
    if pattern != pat {
        // Path cleaning normalizes foo/../bar to bar, which is lossy when
        // the glob should report the un-cleaned names.
        let Some(i) = first_meta(&pattern) else {
            // No wildcard. If anything matches the cleaned pattern, report
            // the original spelling.
            if exists(&pat) {
                return Ok(vec![pat]);
            }
            return Ok(Vec::new());
        };
        if memmem::find(&pattern[i + 1..], b"..").is_some() {
            // Ask the shell to expand the glob instead of losing the `..`
            // to normalisation. Errors are ignored.
            let mut cmdline = BytesMut::from(&b"/bin/ls -d "[..]);
            cmdline.put_slice(&pat);
            let Ok((_, out)) = run_command(
                b"/bin/sh",
                b"-c",
                &cmdline.freeze(),
                RedirectStderr::DevNull,
            ) else {
                return Ok(Vec::new());
            };
            return Ok(word_scanner(&out)
                .map(Bytes::copy_from_slice)
                .collect::<Vec<_>>());
        }
        // prefix + meta + suffix, and the suffix has no '..'. Glob the
        // cleaned pattern, then graft the original prefix back on.
        let prefix = pattern.slice(..i);
        let Some(oi) = first_meta(&pat) else {
            log!("wildcard metachar mismatch? pattern={pattern:?} pat={pat:?}");
            return Ok(Vec::new());
        };
        let oprefix = pat.slice(..oi);
        let matched = libc_glob(&pattern)?;
        let mut files = Vec::new();
        for m in matched {
            let mut file = BytesMut::with_capacity(oprefix.len() + m.len());
            file.put_slice(&oprefix);
            file.put_slice(trim_prefix(&m, &prefix));
            let file = file.freeze();
            if exists(&file) {
                files.push(file);
            }
        }
        return Ok(files);
    }
    Ok(libc_glob(&pat)?)
}
