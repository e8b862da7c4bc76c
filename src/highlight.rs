//! Attacker-heuristic line patterns
//!
//! A line that is unknown to the database gets a second look: if it
//! matches one of these needles it is marked suspect in the scan report.
//! Literal substrings are checked before the regexes.

use std::sync::OnceLock;

use regex::bytes::RegexSet;

const PATTERNS_REGEX: &[&str] = &[
    // php
    r"\$_[A-Z]",       // $_GET, $_POST, etc.
    r#"\S"\s*\.\s*"\S"#, // " . "
    r"\S'\s*\.\s*'\S", // ' . '
    r"@\$?\w{1,16}\(", // suppressed function call
    r"\$.\(\$.\(",     // $x($y(
    r"/\*\s*\w+\s*\*/.+/\*\s*\w+\s*\*/[^\s]+", // comment obfuscation
    r#"include\s{1,10}["'`](\w|/)+\.(png|jpeg|svg|jpg|webp)["'`]"#, // include php as image
    // common
    r"[a-zA-Z0-9/\+=]{25,}",  // long base64 string
    r"(\\x[A-Z0-9]{2}){15,}", // long hex string
    r"(_0x\w{4,8}.+){4,}",    // multiple obfuscated variables
];

const PATTERNS_LITERAL: &[&[u8]] = &[
    // php
    b"system(",
    b"fopen(",
    b"hex2bin(",
    b"die(",
    b"chr(",
    b"hexdec(",
    b"exec",
    b"shell_exec",
    b"passthru",
    b"popen",
    b"proc_open",
    b"pcntl_exec",
    b"pcntl_fork",
    b"escapeshellcmd",
    b"preg_replace",
    b"create_function",
    b"call_user_func_array",
    b"strrev",
    b"str_rot13",
    b"htmlspecialchars_decode",
    b"file_get_contents",
    b"file_put_contents",
    b"fwrite",
    b"fread",
    b"fgetc",
    b"fgets",
    b"fscanf",
    b"fgetss",
    b"fpassthru",
    b"readfile",
    b"gzuncompress",
    b"gzinflate",
    b"gzdecode",
    b"readgzfile",
    b"gzwrite",
    b"gzfile",
    b"umask(",
    b"chmod(",
    b"chown(",
    b"chgrp(",
    b"unlink(",
    b"rmdir(",
    b"mkdir(",
    b"stream_get_meta_data",
    b"GLOBALS",
    b"$pass",
    b"<?php @'$",
    // js
    b"atob",
    b"btoa",
    b"String.fromCharCode(",
    b"jQuery.getScript(",
    // common
    b"../../../../",
    b"base64",
    b"eval",
];

fn regex_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(PATTERNS_REGEX).expect("static highlight patterns"))
}

/// Whether a line contains suspect patterns.
pub fn should_highlight(line: &[u8]) -> bool {
    if PATTERNS_LITERAL
        .iter()
        .any(|p| line.windows(p.len()).any(|w| w == *p))
    {
        return true;
    }
    regex_set().is_match(line)
}
