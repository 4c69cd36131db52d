//! Preset bank codec (RPL format)
//!
//! Parses and emits the `<REAPER_PRESET_LIBRARY>` text format: a quote and
//! backtick aware token stream in which each preset carries a base64 blob.
//! The blob holds up to 64 slider slots, the preset name again (escaped by
//! legacy rules that do not always match the display name), optionally 192
//! more slider slots, a NUL, then the script's raw serialization.
//!
//! Saving is the exact inverse of loading: for every well-formed input the
//! loader accepts, `save(load(text)) == text`. The escaped "blob name" is
//! kept verbatim from the input to make that possible; downstream
//! consumers depend on those exact bytes.
//!
//! Banks are immutable value objects: adding or deleting a preset returns
//! a new bank and leaves the source untouched.

use crate::engine::state::{EffectState, SliderValue};
use crate::parse::dot_atof;
use crate::paths::resolve_case_insensitive;
use crate::types::{Real, MAX_SLIDERS};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Banks larger than this are rejected outright.
const MAX_BANK_INPUT: usize = 1 << 24;

/// One saved preset.
#[derive(Clone, Debug, PartialEq)]
pub struct Preset {
    /// Display name, as written in the `<PRESET` header.
    pub name: String,
    /// The name as encoded inside the binary blob. May legitimately differ
    /// from `name` because of legacy escaping quirks; re-emitted verbatim
    /// on save.
    pub blob_name: String,
    pub state: EffectState,
}

/// A named, ordered collection of presets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bank {
    pub name: String,
    pub presets: Vec<Preset>,
}

impl Bank {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            presets: Vec::new(),
        }
    }

    /// Index of the preset with this exact name, when present. Duplicate
    /// names resolve to the last occurrence.
    pub fn preset_index(&self, name: &str) -> Option<usize> {
        let mut found = None;
        for (i, preset) in self.presets.iter().enumerate() {
            if preset.name == name {
                found = Some(i);
            }
        }
        found
    }

    /// Return a new bank with the preset added. A preset with the same
    /// name is overwritten in place, keeping its index.
    pub fn add_preset(&self, name: &str, state: EffectState) -> Bank {
        let mut bank = self.clone();
        let preset = Preset {
            name: name.to_string(),
            blob_name: escape_name(name),
            state,
        };
        match self.preset_index(name) {
            Some(index) => bank.presets[index] = preset,
            None => bank.presets.push(preset),
        }
        bank
    }

    /// Return a new bank without the named preset, preserving the order of
    /// the rest. Unknown names return an unchanged copy.
    pub fn delete_preset(&self, name: &str) -> Bank {
        let mut bank = self.clone();
        if let Some(index) = self.preset_index(name) {
            bank.presets.remove(index);
        }
        bank
    }
}

//------------------------------------------------------------------------------
// tokenizer

/// Split bank text into tokens. Tokens starting with `"`, `'` or `` ` ``
/// run to the matching close quote, which is stripped. `None` on an
/// unterminated quote.
fn tokenize(text: &str) -> Option<Vec<String>> {
    let b = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < b.len() {
        if b[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if matches!(b[i], b'"' | b'\'' | b'`') {
            let quote = b[i];
            let start = i + 1;
            let mut j = start;
            while j < b.len() && b[j] != quote {
                j += 1;
            }
            if j >= b.len() {
                return None;
            }
            tokens.push(String::from_utf8_lossy(&b[start..j]).into_owned());
            i = j + 1;
        } else {
            let start = i;
            while i < b.len() && !b[i].is_ascii_whitespace() {
                i += 1;
            }
            tokens.push(String::from_utf8_lossy(&b[start..i]).into_owned());
        }
    }

    Some(tokens)
}

//------------------------------------------------------------------------------
// name escaping

fn funky_flags(name: &str) -> u32 {
    let mut flags = 0;
    for &b in name.as_bytes() {
        match b {
            b'"' => flags |= 1,
            b'\'' => flags |= 2,
            b'`' => flags |= 4,
            b' ' => flags |= 8,
            _ => {}
        }
        if flags == 15 {
            break;
        }
    }
    flags
}

/// Quote a name for storage. Plain names pass through; a name containing
/// some of `"`, `'`, `` ` `` or space is wrapped in a quote character it
/// does not contain; a name containing all four is wrapped in backticks
/// with the inner backticks rewritten to single quotes.
pub fn escape_name(name: &str) -> String {
    let flags = funky_flags(name);
    if flags == 0 {
        return name.to_string();
    }

    if flags != 15 {
        let quote = if flags & 1 != 0 {
            if flags & 2 != 0 {
                '`'
            } else {
                '\''
            }
        } else {
            '"'
        };
        format!("{}{}{}", quote, name, quote)
    } else {
        let inner: String = name
            .chars()
            .map(|c| if c == '`' { '\'' } else { c })
            .collect();
        format!("`{}`", inner)
    }
}

//------------------------------------------------------------------------------
// blob decoding

fn find_sub(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from + needle.len() > hay.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Locate the display name inside the blob text and mask it out, so its
/// quote characters cannot confuse the slider tokenizer. Returns the
/// masked text and the raw whitespace-delimited token that held the name.
fn remove_name_from_blob(text: &[u8], name: &str) -> Option<(Vec<u8>, String)> {
    if funky_flags(name) & 7 == 0 {
        return None;
    }

    let name_pos = find_sub(text, name.as_bytes(), 0)?;
    // bail out when the match is not unique
    if find_sub(text, name.as_bytes(), name_pos + 1).is_some() {
        return None;
    }

    // expand left to the enclosing whitespace-delimited token
    let mut start_pos = name_pos;
    while text[start_pos] != b' ' && start_pos > 0 {
        start_pos -= 1;
    }
    start_pos += 1;

    let mut stop_pos = name_pos + name.len();
    while stop_pos < text.len() && text[stop_pos] != b' ' {
        stop_pos += 1;
    }

    let token = String::from_utf8_lossy(&text[start_pos..stop_pos]).into_owned();
    let mut masked = text.to_vec();
    for byte in &mut masked[start_pos..stop_pos] {
        *byte = b'_';
    }

    Some((masked, token))
}

fn parse_preset_from_blob(name: &str, data: &[u8]) -> Preset {
    let nul = data.iter().position(|&b| b == 0);
    let text: &[u8] = match nul {
        Some(pos) => &data[..pos],
        None => data,
    };
    let state_data = match nul {
        Some(pos) => data[pos + 1..].to_vec(),
        None => Vec::new(),
    };

    let mut blob_name: Option<String> = None;
    let removed = remove_name_from_blob(text, name);
    let parse_text: Vec<u8> = match &removed {
        Some((masked, token)) => {
            blob_name = Some(token.clone());
            masked.clone()
        }
        None => text.to_vec(),
    };

    let mut sliders = Vec::new();
    if let Some(tokens) = tokenize(&String::from_utf8_lossy(&parse_text)) {
        let tok = |i: usize| -> &str { tokens.get(i).map(String::as_str).unwrap_or("") };

        for i in 0..64 {
            let value = tok(i);
            if value != "-" {
                sliders.push(SliderValue {
                    index: i as u32,
                    value: dot_atof(value),
                });
            }
        }

        // token 64 repeats the preset name, re-escaped
        if removed.is_none() {
            blob_name = Some(escape_name(tok(64)));
        }

        if !tok(65).is_empty() {
            for i in 0..MAX_SLIDERS - 64 {
                let value = tok(i + 65);
                if value != "-" {
                    sliders.push(SliderValue {
                        index: (i + 64) as u32,
                        value: dot_atof(value),
                    });
                }
            }
        }
    }

    Preset {
        name: name.to_string(),
        blob_name: blob_name.unwrap_or_else(|| escape_name(name)),
        state: EffectState {
            sliders,
            data: state_data,
        },
    }
}

//------------------------------------------------------------------------------
// bank load

/// Parse bank text. Malformed input yields `None` ("no bank"), never an
/// error the caller has to unwind.
pub fn load_bank_from_text(text: &str) -> Option<Bank> {
    let normalized: String = text
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();

    let tokens = tokenize(&normalized)?;
    let tok = |i: usize| -> &str { tokens.get(i).map(String::as_str).unwrap_or("") };

    if tok(0) != "<REAPER_PRESET_LIBRARY" {
        return None;
    }
    let bank_name = tok(1).to_string();

    let mut presets = Vec::new();
    let mut itok = 2;
    while itok < tokens.len() {
        if tok(itok) == "<PRESET" {
            itok += 1;
            let preset_name = tok(itok).to_string();
            itok += 1;

            let mut blob: Vec<u8> = Vec::with_capacity(64 * 1024);
            while itok < tokens.len() {
                let part = tok(itok);
                itok += 1;
                if part == ">" {
                    break;
                }
                match BASE64.decode(part) {
                    Ok(chunk) => blob.extend_from_slice(&chunk),
                    Err(err) => debug!("skipping malformed base64 chunk: {}", err),
                }
            }

            presets.push(parse_preset_from_blob(&preset_name, &blob));
        } else {
            itok += 1;
        }
    }

    Some(Bank {
        name: bank_name,
        presets,
    })
}

/// Load a bank from disk. Any failure (missing file, malformed text,
/// oversized input) yields `None`.
pub fn load_bank(path: &Path) -> Option<Bank> {
    let data = fs::read(path).ok()?;
    if data.len() > MAX_BANK_INPUT {
        return None;
    }
    load_bank_from_text(&String::from_utf8_lossy(&data))
}

//------------------------------------------------------------------------------
// bank save

/// `%.6f` with trailing zeros (and a bare trailing dot) stripped.
fn format_value(value: Real) -> String {
    let mut out = format!("{:.6}", value);
    while out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out
}

fn preset_blob_lines(blob_name: &str, state: &EffectState) -> String {
    let mut values = [0.0 as Real; MAX_SLIDERS];
    let mut used = [false; MAX_SLIDERS];
    let mut more_than_64 = false;

    for slider in &state.sliders {
        let index = slider.index as usize;
        if index < MAX_SLIDERS {
            used[index] = true;
            values[index] = slider.value;
            if index >= 64 {
                more_than_64 = true;
            }
        }
    }

    let mut blob = String::with_capacity(4096);
    for i in 0..64 {
        if used[i] {
            blob.push_str(&format_value(values[i]));
            blob.push(' ');
        } else {
            blob.push_str("- ");
        }
    }

    blob.push_str(blob_name);
    blob.push(' ');

    if more_than_64 {
        for i in 0..MAX_SLIDERS - 64 {
            if used[i + 64] {
                blob.push_str(&format_value(values[i + 64]));
                blob.push(' ');
            } else {
                blob.push_str("- ");
            }
        }
    }
    blob.pop();

    let mut bytes = blob.into_bytes();
    bytes.push(0);
    bytes.extend_from_slice(&state.data);

    let encoded = BASE64.encode(&bytes);
    let mut lines = String::with_capacity(encoded.len() + encoded.len() / 128 * 8 + 8);
    let encoded = encoded.as_bytes();
    for chunk in encoded.chunks(128) {
        lines.push_str("    ");
        lines.push_str(std::str::from_utf8(chunk).unwrap());
        lines.push('\n');
    }
    lines
}

/// Serialize a bank to RPL text, the exact inverse of
/// [`load_bank_from_text`].
pub fn save_bank_to_text(bank: &Bank) -> String {
    let mut out = format!("<REAPER_PRESET_LIBRARY {}\n", escape_name(&bank.name));
    for preset in &bank.presets {
        out.push_str("  <PRESET `");
        out.push_str(&preset.name);
        out.push_str("`\n");
        out.push_str(&preset_blob_lines(&preset.blob_name, &preset.state));
        out.push_str("  >\n");
    }
    out.push_str(">\n");
    out
}

/// Write a bank to disk.
pub fn save_bank(path: &Path, bank: &Bank) -> io::Result<()> {
    fs::write(path, save_bank_to_text(bank))
}

/// Locate the companion `<effectfile>.rpl` next to an effect source,
/// matching the file name case-insensitively.
pub fn locate_companion_bank(effect_path: &Path) -> Option<PathBuf> {
    let dir = effect_path.parent()?;
    let file_name = effect_path.file_name()?.to_string_lossy();
    let found = resolve_case_insensitive(dir, &format!("{}.rpl", file_name))?;
    found.is_file().then_some(found)
}
