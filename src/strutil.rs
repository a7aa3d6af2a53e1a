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

use bytes::{BufMut, Bytes, BytesMut};
use memchr::{memchr, memrchr};

pub fn is_space_byte(c: &u8) -> bool {
    let c = *c;
    (b'\t'..=b'\r').contains(&c) || c == b' '
}

pub fn word_scanner(s: &[u8]) -> impl Iterator<Item = &[u8]> {
    s.split(is_space_byte).filter(|s| !s.is_empty())
}

pub fn trim_prefix_str<'a>(s: &'a str, prefix: &str) -> &'a str {
    match s.strip_prefix(prefix) {
        Some(s) => s,
        None => s,
    }
}

pub fn trim_prefix<'a>(s: &'a [u8], prefix: &[u8]) -> &'a [u8] {
    match s.strip_prefix(prefix) {
        Some(s) => s,
        None => s,
    }
}

pub fn trim_suffix<'a>(s: &'a [u8], suffix: &[u8]) -> &'a [u8] {
    match s.strip_suffix(suffix) {
        Some(s) => s,
        None => s,
    }
}

pub fn trim_leading_curdir(mut s: &[u8]) -> &[u8] {
    while s.starts_with(b"./") {
        s = &s[2..];
    }
    s
}

/// A make pattern: either a literal string or `prefix%suffix`. Matching and
/// substitution are the `%` semantics of pattern rules, so `%.o` matches
/// `dir/foo.o` with stem `dir/foo`.
#[derive(Debug)]
pub struct Pattern {
    pat: Bytes,
    percent_index: Option<usize>,
}

impl Pattern {
    pub fn new(pat: Bytes) -> Pattern {
        let idx = memchr(b'%', &pat);
        Pattern {
            pat,
            percent_index: idx,
        }
    }

    pub fn matches(&self, str: &[u8]) -> bool {
        if let Some(percent_index) = self.percent_index {
            return self.match_impl(str, percent_index);
        }
        self.pat == str
    }

    fn match_impl(&self, str: &[u8], percent_index: usize) -> bool {
        str.len() + 1 >= self.pat.len()
            && str.starts_with(&self.pat[..percent_index])
            && str.ends_with(&self.pat[percent_index + 1..])
    }

    pub fn stem<'a>(&self, str: &'a [u8]) -> &'a [u8] {
        if !self.matches(str) {
            return &[];
        }
        if let Some(percent_index) = self.percent_index {
            return &str[percent_index..(str.len() + 1 + percent_index - self.pat.len())];
        }
        &[]
    }

    /// Substitutes `s`'s stem into `subst`. If `subst` has no `%`, it is
    /// returned as-is; if `s` doesn't match, `s` is returned unchanged.
    pub fn append_subst(&self, s: &Bytes, subst: &Bytes) -> Bytes {
        let Some(percent_index) = self.percent_index else {
            if s == &self.pat {
                return subst.clone();
            }
            return s.clone();
        };

        if self.match_impl(s, percent_index) {
            if let Some(subst_percent_index) = memchr(b'%', subst) {
                let mut ret = BytesMut::with_capacity(subst.len() + s.len() - self.pat.len() + 1);
                ret.put_slice(&subst[..subst_percent_index]);
                ret.put_slice(&s[percent_index..(percent_index + s.len() + 1 - self.pat.len())]);
                ret.put_slice(&subst[subst_percent_index + 1..]);
                return ret.into();
            }
            return subst.clone();
        }
        s.clone()
    }
}

pub fn dirname(s: &[u8]) -> Bytes {
    let Some(found) = memrchr(b'/', s) else {
        return Bytes::from_static(b".");
    };
    if found == 0 {
        return Bytes::from_static(b"/");
    }
    Bytes::copy_from_slice(&s[..found])
}

pub fn basename(s: &[u8]) -> &[u8] {
    let Some(found) = memrchr(b'/', s) else {
        return s;
    };
    if found == 0 {
        return s;
    }
    &s[found + 1..]
}

/// Extension of the basename, dot included (`foo/bar.o` => `.o`). None when
/// the basename has no dot.
pub fn get_ext(s: &[u8]) -> Option<&[u8]> {
    let found = memrchr(b'.', s)?;
    if let Some(slash_index) = memrchr(b'/', s)
        && found < slash_index
    {
        return None;
    }
    Some(&s[found..])
}

pub fn strip_ext(s: &[u8]) -> &[u8] {
    let Some(found) = memrchr(b'.', s) else {
        return s;
    };
    if let Some(slash_index) = memrchr(b'/', s)
        && found < slash_index
    {
        return s;
    }
    &s[0..found]
}

/// Lexical path cleaning: collapses `.` and duplicate separators, resolves
/// `..` without consulting the filesystem. `./foo` becomes `foo`, and the
/// empty path stays empty.
pub fn normalize_path(mut o: &[u8]) -> Bytes {
    if o.is_empty() {
        return Bytes::new();
    }
    let mut ret = BytesMut::new();
    if o.starts_with(b"/") {
        ret.put_u8(b'/');
        o = &o[1..];
    }
    while !o.is_empty() {
        let idx = memchr(b'/', o);
        let (dir, rest) = match idx {
            Some(idx) => (&o[..idx], &o[idx + 1..]),
            None => (o, [].as_slice()),
        };
        o = rest;

        if dir == b"." || (dir == b".." && ret.as_ref() == b"/") {
            continue;
        } else if dir == b".." && !ret.is_empty() && ret.as_ref() != b".." && !ret.ends_with(b"/..")
        {
            match memrchr(b'/', ret.as_ref()) {
                Some(index) => {
                    if index == 0 {
                        ret.truncate(1);
                    } else {
                        ret.truncate(index);
                    }
                }
                None => {
                    ret.truncate(0);
                }
            }
        } else if !dir.is_empty() {
            if !ret.is_empty() && !ret.ends_with(b"/") {
                ret.put_u8(b'/');
            }
            ret.put_slice(dir);
        }
    }
    ret.into()
}

pub fn concat_dir(b: &[u8], n: &[u8]) -> Bytes {
    let mut r = BytesMut::new();
    if !b.is_empty() && !n.starts_with(b"/") {
        r.put_slice(b);
        r.put_u8(b'/');
    }
    r.put_slice(n);
    normalize_path(&r)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_word_scanner() {
        let ss = word_scanner(b"foo.o  bar.o\tbaz.o").collect::<Vec<&[u8]>>();
        assert_eq!(
            ss,
            vec![b"foo.o".as_slice(), b"bar.o".as_slice(), b"baz.o".as_slice()]
        );

        let ss = word_scanner(b"").collect::<Vec<&[u8]>>();
        assert!(ss.is_empty());
    }

    #[test]
    fn test_pattern_matches() {
        assert!(Pattern::new(Bytes::from_static(b"foo")).matches(b"foo"));
        assert!(Pattern::new(Bytes::from_static(b"foo%")).matches(b"foo"));
        assert!(Pattern::new(Bytes::from_static(b"%.o")).matches(b"foo.o"));
        assert!(Pattern::new(Bytes::from_static(b"%.o")).matches(b"dir/foo.o"));
        assert!(!Pattern::new(Bytes::from_static(b"%.o")).matches(b"foo.c"));
        assert!(Pattern::new(Bytes::from_static(b"foo%bar")).matches(b"fooxbar"));
        assert!(!Pattern::new(Bytes::from_static(b"foo%bar")).matches(b"fobar"));
    }

    #[test]
    fn test_pattern_stem() {
        let pat = Pattern::new(Bytes::from_static(b"out/%.o"));
        assert_eq!(pat.stem(b"out/foo.o"), b"foo");
        assert_eq!(pat.stem(b"out/sub/foo.o"), b"sub/foo");
    }

    fn subst_pattern(s: &'static [u8], pat: &'static [u8], subst: &'static [u8]) -> String {
        let p = Pattern::new(Bytes::from_static(pat));
        let s = Bytes::from_static(s);
        let subst = Bytes::from_static(subst);
        String::from_utf8(p.append_subst(&s, &subst).to_vec()).unwrap()
    }

    #[test]
    fn test_subst_pattern() {
        assert_eq!(subst_pattern(b"foo.o", b"%.o", b"%.c"), "foo.c");
        assert_eq!(subst_pattern(b"dir/foo.o", b"%.o", b"%.c"), "dir/foo.c");
        assert_eq!(subst_pattern(b"foo.o", b"%.o", b"stamp"), "stamp");
        // Not a match, left untouched.
        assert_eq!(subst_pattern(b"foo.c", b"%.o", b"%.c"), "foo.c");
        // Round trip: subst(p%s, stem) re-assembles the matched string.
        let pat = Pattern::new(Bytes::from_static(b"lib%.a"));
        assert!(pat.matches(b"libfoo.a"));
        assert_eq!(pat.stem(b"libfoo.a"), b"foo");
        assert_eq!(
            pat.append_subst(&Bytes::from_static(b"libfoo.a"), &Bytes::from_static(b"lib%.a")),
            Bytes::from_static(b"libfoo.a")
        );
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(b"foo/../bar"), Bytes::from_static(b"bar"));
        assert_eq!(normalize_path(b"./foo//bar/."), Bytes::from_static(b"foo/bar"));
        assert_eq!(normalize_path(b"/a/b/../../c"), Bytes::from_static(b"/c"));
        assert_eq!(normalize_path(b"../foo"), Bytes::from_static(b"../foo"));
        assert_eq!(normalize_path(b"."), Bytes::new());
        assert_eq!(normalize_path(b""), Bytes::new());
    }

    #[test]
    fn test_normalize_path_idempotent() {
        for p in [
            &b"foo/../bar"[..],
            b"./x/./y",
            b"//a///b",
            b"a/b/c/../..",
            b"/../x",
            b"..",
        ] {
            let once = normalize_path(p);
            let twice = normalize_path(&once);
            assert_eq!(once, twice, "clean not idempotent for {:?}", p);
        }
    }

    #[test]
    fn test_basename_dirname() {
        assert_eq!(basename(b"foo/bar.o"), b"bar.o");
        assert_eq!(basename(b"bar.o"), b"bar.o");
        assert_eq!(dirname(b"foo/bar.o"), Bytes::from_static(b"foo"));
        assert_eq!(dirname(b"bar.o"), Bytes::from_static(b"."));
    }

    #[test]
    fn test_get_ext() {
        assert_eq!(get_ext(b"foo.c"), Some(&b".c"[..]));
        assert_eq!(get_ext(b"dir/foo.c"), Some(&b".c"[..]));
        assert_eq!(get_ext(b"dir.x/foo"), None);
        assert_eq!(get_ext(b"foo"), None);
    }

    #[test]
    fn test_strip_ext() {
        assert_eq!(strip_ext(b"foo.c"), b"foo");
        assert_eq!(strip_ext(b"dir.x/foo"), b"dir.x/foo");
        assert_eq!(strip_ext(b"dir/foo.c"), b"dir/foo");
    }

    #[test]
    fn test_concat_dir() {
        assert_eq!(concat_dir(b"src", b"foo.c"), Bytes::from_static(b"src/foo.c"));
        assert_eq!(concat_dir(b"src", b"/abs"), Bytes::from_static(b"/abs"));
        assert_eq!(concat_dir(b"", b"foo.c"), Bytes::from_static(b"foo.c"));
    }

    #[test]
    fn test_trim_leading_curdir() {
        assert_eq!(trim_leading_curdir(b"./foo"), b"foo");
        assert_eq!(trim_leading_curdir(b"././foo"), b"foo");
        assert_eq!(trim_leading_curdir(b"foo"), b"foo");
    }
}
