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

use std::{
    env,
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    sync::LazyLock,
    vec::IntoIter,
};

use crate::symtab::intern;

pub static FLAGS: LazyLock<Flags> = LazyLock::new(|| {
    if cfg!(test) {
        Flags::default()
    } else {
        Flags::from_args(env::args_os().collect())
    }
});

#[derive(Default)]
pub struct Flags {
    pub enable_debug: bool,
    pub enable_stat_logs: bool,
    pub color_warnings: bool,
    pub use_wildcard_cache: bool,
    pub use_find_cache: bool,
    pub find_cache_prunes: Vec<OsString>,
    pub find_cache_leaf_names: Vec<OsString>,
    pub working_dir: Option<OsString>, // -C <dir>
    pub num_cpus: usize,
    pub targets: Vec<crate::symtab::Symbol>,
}

fn parse_command_line_option_with_arg(
    option: &str,
    arg: &OsStr,
    args: &mut IntoIter<OsString>,
) -> Option<OsString> {
    let arg = arg.as_bytes();
    let arg = arg.strip_prefix(option.as_bytes())?;
    if arg.is_empty() {
        return args.next();
    }
    if let Some(arg) = arg.strip_prefix(b"=") {
        return Some(OsString::from_vec(arg.to_vec()));
    }
    // E.g, -C/path/to/dir
    if option.len() == 2 {
        return Some(OsString::from_vec(arg.to_vec()));
    }
    None
}

impl Flags {
    fn from_args(args: Vec<OsString>) -> Flags {
        let mut iter = args.into_iter();
        let mut flags = Flags::default();
        // argv[0]
        let _ = iter.next();
        flags.num_cpus = std::thread::available_parallelism().map_or(1, |p| p.get());

        while let Some(arg) = iter.next() {
            match arg.as_bytes() {
                b"-d" => flags.enable_debug = true,
                b"--stats" => flags.enable_stat_logs = true,
                b"--color_warnings" => flags.color_warnings = true,
                b"--use_wildcard_cache" => flags.use_wildcard_cache = true,
                b"--use_find_cache" => flags.use_find_cache = true,
                _ => {
                    if let Some(arg) = parse_command_line_option_with_arg("-C", &arg, &mut iter) {
                        flags.working_dir = Some(arg);
                    } else if let Some(arg) =
                        parse_command_line_option_with_arg("--find_cache_prune_dir", &arg, &mut iter)
                    {
                        flags.find_cache_prunes.push(arg);
                    } else if let Some(arg) =
                        parse_command_line_option_with_arg("--find_cache_leaf_name", &arg, &mut iter)
                    {
                        flags.find_cache_leaf_names.push(arg);
                    } else if arg.as_bytes().starts_with(b"-") {
                        panic!("Unknown flag: {}", arg.to_string_lossy());
                    } else {
                        let arg = bytes::Bytes::from(arg.as_bytes().to_vec());
                        flags.targets.push(intern(arg));
                    }
                }
            }
        }

        flags
    }
}
