//! Header and section parsing
//!
//! Splits effect source text into named code sections and parses the header
//! metadata lines into a [`Header`]. The line grammars here are intentionally
//! permissive to stay compatible with the wide range of effect files found
//! in the wild: malformed slider lines are rejected, but trailing garbage
//! after a recognized declaration is tolerated.

use crate::types::{
    ConfigItem, Header, ParseError, Real, Section, SliderDef, SliderShape, Toplevel,
    MAX_CHANNELS, MAX_SLIDERS,
};
use std::collections::HashSet;
use tracing::warn;

fn is_space(b: u8) -> bool {
    b.is_ascii_whitespace()
}

/// Parse a leading floating-point number, `strtod` style: leading ASCII
/// whitespace is skipped, the decimal separator is always `.`. Returns the
/// value and the number of bytes consumed (0 when nothing parsed).
fn parse_real_prefix(s: &str) -> (Real, usize) {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() && is_space(b[i]) {
        i += 1;
    }
    let start = i;
    let mut j = i;
    if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
        j += 1;
    }
    let int_start = j;
    while j < b.len() && b[j].is_ascii_digit() {
        j += 1;
    }
    let mut any = j > int_start;
    if j < b.len() && b[j] == b'.' {
        j += 1;
        let frac_start = j;
        while j < b.len() && b[j].is_ascii_digit() {
            j += 1;
        }
        any = any || j > frac_start;
    }
    if !any {
        return (0.0, 0);
    }
    let mut end = j;
    if j < b.len() && (b[j] == b'e' || b[j] == b'E') {
        let mut k = j + 1;
        if k < b.len() && (b[k] == b'+' || b[k] == b'-') {
            k += 1;
        }
        let exp_start = k;
        while k < b.len() && b[k].is_ascii_digit() {
            k += 1;
        }
        if k > exp_start {
            end = k;
        }
    }
    let value = s[start..end].parse::<Real>().unwrap_or(0.0);
    (value, end)
}

/// Locale-independent `atof`.
pub fn dot_atof(s: &str) -> Real {
    parse_real_prefix(s).0
}

fn new_or_append(slot: &mut Option<Section>, line_no: u32) {
    match slot {
        None => {
            *slot = Some(Section {
                text: String::new(),
                line_offset: line_no + 1,
            });
        }
        Some(section) => {
            // A section may recur later in the file; its parts are glued
            // together with blank lines so stored line offsets stay valid
            // for compile errors.
            let num_lines = section.text.bytes().filter(|&b| b == b'\n').count() as i64;
            let pad = line_no as i64 - section.line_offset as i64 - num_lines + 1;
            for _ in 0..pad.max(0) {
                section.text.push('\n');
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum SectionKind {
    Header,
    Init,
    Slider,
    Block,
    Sample,
    Gfx,
    Serialize,
}

/// Split source text into its header and code sections.
pub fn parse_toplevel(text: &str) -> Result<Toplevel, ParseError> {
    let mut toplevel = Toplevel::default();
    let mut current = SectionKind::Header;

    for (lineno, line) in text.lines().enumerate() {
        let lineno = lineno as u32;
        if line.as_bytes().first() == Some(&b'@') {
            let mut tokens = line.split_ascii_whitespace();
            let name = tokens.next().unwrap_or("");
            current = match name {
                "@init" => {
                    new_or_append(&mut toplevel.init, lineno);
                    SectionKind::Init
                }
                "@slider" => {
                    new_or_append(&mut toplevel.slider, lineno);
                    SectionKind::Slider
                }
                "@block" => {
                    new_or_append(&mut toplevel.block, lineno);
                    SectionKind::Block
                }
                "@sample" => {
                    new_or_append(&mut toplevel.sample, lineno);
                    SectionKind::Sample
                }
                "@serialize" => {
                    new_or_append(&mut toplevel.serialize, lineno);
                    SectionKind::Serialize
                }
                "@gfx" => {
                    new_or_append(&mut toplevel.gfx, lineno);
                    let gfx_w = tokens.next().map(dot_atof).unwrap_or(0.0) as i64;
                    let gfx_h = tokens.next().map(dot_atof).unwrap_or(0.0) as i64;
                    toplevel.gfx_w = if gfx_w > 0 { gfx_w as u32 } else { 0 };
                    toplevel.gfx_h = if gfx_h > 0 { gfx_h as u32 } else { 0 };
                    SectionKind::Gfx
                }
                _ => {
                    return Err(ParseError {
                        line: lineno,
                        message: format!("Invalid section: {}", line),
                    });
                }
            };
        } else {
            let section = match current {
                SectionKind::Header => &mut toplevel.header,
                SectionKind::Init => toplevel.init.as_mut().unwrap(),
                SectionKind::Slider => toplevel.slider.as_mut().unwrap(),
                SectionKind::Block => toplevel.block.as_mut().unwrap(),
                SectionKind::Sample => toplevel.sample.as_mut().unwrap(),
                SectionKind::Gfx => toplevel.gfx.as_mut().unwrap(),
                SectionKind::Serialize => toplevel.serialize.as_mut().unwrap(),
            };
            section.text.push_str(line);
            section.text.push('\n');
        }
    }

    Ok(toplevel)
}

/// Collect the header lines only, stopping at the first `@section`. Used to
/// pre-scan `config:` constants before the preprocessor runs.
pub fn header_prescan(text: &str) -> Section {
    let mut section = Section::default();
    for line in text.lines() {
        if line.as_bytes().first() == Some(&b'@') {
            break;
        }
        section.text.push_str(line);
        section.text.push('\n');
    }
    section
}

/// Parse the header section into structured metadata. Two passes: regular
/// metadata lines first, then comment-form fallbacks (`//author:`,
/// `//tags:`) which only fill fields pass 1 left empty.
pub fn parse_header(section: &Section) -> Result<Header, ParseError> {
    let mut header = Header::default();
    let mut config_identifiers: HashSet<String> = HashSet::new();
    let mut lineno = section.line_offset;

    for line in section.text.lines() {
        if let Some(rest) = line.strip_prefix("desc:") {
            if header.desc.is_empty() {
                header.desc = rest.trim().to_string();
            }
        } else if let Some(rest) = line.strip_prefix("author:") {
            if header.author.is_empty() {
                header.author = rest.trim().to_string();
            }
        } else if let Some(rest) = line.strip_prefix("tags:") {
            if header.tags.is_empty() {
                header.tags = rest.split_ascii_whitespace().map(str::to_string).collect();
            }
        } else if let Some(rest) = line.strip_prefix("in_pin:") {
            header.explicit_pins = true;
            header.in_pins.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("out_pin:") {
            header.explicit_pins = true;
            header.out_pins.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("config:") {
            let item = parse_config_line(rest);
            if item.is_valid() {
                let identifier = item.identifier.to_ascii_lowercase();
                if !config_identifiers.insert(identifier) {
                    return Err(ParseError {
                        line: lineno,
                        message: format!("Duplicate config variable: {}", item.identifier),
                    });
                }
                header.config_items.push(item);
            }
        } else if let Some(rest) = line.strip_prefix("options:") {
            parse_options_line(rest, &mut header);
        } else if let Some(rest) = line.strip_prefix("import") {
            if rest.as_bytes().first().is_some_and(|&b| is_space(b)) {
                header.imports.push(rest[1..].trim().to_string());
            }
        } else if let Some(slider) = parse_slider_line(line) {
            let id = slider.id as usize;
            header.sliders[id] = SliderDef {
                exists: true,
                ..slider
            };
        } else if let Some((index, filename)) = parse_filename_line(line) {
            if index as usize == header.filenames.len() {
                header.filenames.push(filename);
            }
        }
        lineno += 1;
    }

    // some files carry metadata in comments; take it when nothing better
    for line in section.text.lines() {
        if let Some(rest) = line.strip_prefix("//author:") {
            if header.author.is_empty() {
                header.author = rest.trim().to_string();
            }
        } else if let Some(rest) = line.strip_prefix("//tags:") {
            if header.tags.is_empty() {
                header.tags = rest.split_ascii_whitespace().map(str::to_string).collect();
            }
        }
    }

    if header.in_pins.len() == 1 && header.in_pins[0].eq_ignore_ascii_case("none") {
        header.in_pins.clear();
    }
    if header.out_pins.len() == 1 && header.out_pins[0].eq_ignore_ascii_case("none") {
        header.out_pins.clear();
    }
    header.in_pins.truncate(MAX_CHANNELS);
    header.out_pins.truncate(MAX_CHANNELS);

    Ok(header)
}

/// Parse the value part of a `config:` line. Returns a possibly-incomplete
/// item; the caller decides validity via [`ConfigItem::is_valid`].
pub fn parse_config_line(rest: &str) -> ConfigItem {
    let mut item = ConfigItem::default();
    let b = rest.as_bytes();

    let mut cur = 0;
    while cur < b.len() && is_space(b[cur]) {
        cur += 1;
    }
    let ident_start = cur;
    while cur < b.len() && !is_space(b[cur]) {
        cur += 1;
    }
    item.identifier = rest[ident_start..cur].to_string();

    let mut pos = cur;
    while pos < b.len() && is_space(b[pos]) {
        pos += 1;
    }
    if pos >= b.len() {
        return item;
    }
    cur = pos;

    let closing = match b[pos] {
        b'"' => b'"',
        b'\'' => b'\'',
        _ => b' ',
    };
    pos += 1;
    if pos >= b.len() {
        return item;
    }
    while pos < b.len() && b[pos] != closing {
        pos += 1;
    }
    if closing == b'"' {
        item.name = rest[cur + 1..pos].to_string();
    } else {
        item.name = rest[cur..pos].to_string();
    }

    cur = pos + 1;
    while cur < b.len() && is_space(b[cur]) {
        cur += 1;
    }
    let (default_value, used) = parse_real_prefix(&rest[cur..]);
    item.default_value = default_value;
    if used == 0 {
        return item;
    }
    pos = cur + used;

    cur = pos + 1;
    while cur <= b.len() {
        while cur < b.len() && is_space(b[cur]) {
            cur += 1;
        }
        if cur >= b.len() {
            break;
        }

        let (value, used) = parse_real_prefix(&rest[cur..]);
        if used == 0 {
            return item;
        }
        let mut key = rest[cur..cur + used].trim().to_string();
        cur += used;

        while cur < b.len() && is_space(b[cur]) {
            cur += 1;
        }
        if cur < b.len() && b[cur] == b'=' {
            cur += 1;
            while cur < b.len() && is_space(b[cur]) {
                cur += 1;
            }
            if cur < b.len() {
                let closing = match b[cur] {
                    b'"' => b'"',
                    b'\'' => b'\'',
                    _ => b' ',
                };
                pos = cur + 1;
                while pos < b.len() && b[pos] != closing {
                    pos += 1;
                }
                key = match closing {
                    b'"' => rest[cur + 1..pos].to_string(),
                    b' ' => rest[cur..pos].to_string(),
                    _ => rest[cur..pos + usize::from(pos < b.len())].to_string(),
                };
                cur = pos + usize::from(pos < b.len());
            }
        }

        item.var_names.push(key);
        item.var_values.push(value);
    }

    item
}

/// Collapse whitespace runs touching a `=` so `key  =  value` tokenizes as
/// `key=value`.
fn trim_spaces_around_equals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_whitespace() {
            while matches!(chars.peek(), Some(c2) if c2.is_ascii_whitespace()) {
                chars.next();
            }
            let next_is_eq = matches!(chars.peek(), Some('='));
            if !out.ends_with('=') && !next_is_eq {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_options_line(rest: &str, header: &mut Header) {
    let line = trim_spaces_around_equals(rest);
    for opt in line.split_ascii_whitespace() {
        let (name, value) = match opt.find('=') {
            Some(pos) => (&opt[..pos], &opt[pos + 1..]),
            None => (opt, ""),
        };
        match name {
            "gmem" => header.options.gmem = value.to_string(),
            "maxmem" => {
                let maxmem = dot_atof(value) as i64;
                header.options.maxmem = if maxmem < 0 { 0 } else { maxmem as u32 };
            }
            "prealloc" => {
                header.options.prealloc = if value == "*" {
                    -1
                } else {
                    dot_atof(value) as i64
                };
            }
            "want_all_kb" => header.options.want_all_kb = true,
            "no_meter" => header.options.no_meter = true,
            "gfx_hz" => {
                let gfx_hz = dot_atof(value);
                if gfx_hz > 0.0 && gfx_hz < 2000.0 {
                    header.options.gfx_hz = gfx_hz as u32;
                }
            }
            _ => {}
        }
    }
}

/// Parse a `sliderN:` declaration. This parser is intentionally very
/// permissive to match the reference behavior; `None` means the line is not
/// an acceptable slider declaration.
pub fn parse_slider_line(line: &str) -> Option<SliderDef> {
    let b = line.as_bytes();
    if b.len() < 6 || !b[..6].eq_ignore_ascii_case(b"slider") {
        return None;
    }
    let mut cur = 6;

    // id is written 1-based
    while cur < b.len() && is_space(b[cur]) {
        cur += 1;
    }
    let id_start = cur;
    while cur < b.len() && b[cur].is_ascii_digit() {
        cur += 1;
    }
    let id: u64 = line[id_start..cur].parse().ok()?;
    if id < 1 || id > MAX_SLIDERS as u64 {
        return None;
    }
    let mut slider = SliderDef {
        id: (id - 1) as u32,
        ..Default::default()
    };

    if cur >= b.len() || b[cur] != b':' {
        return None;
    }
    cur += 1;
    while cur < b.len() && is_space(b[cur]) {
        cur += 1;
    }

    // an `=` before any `<` or `,` names a custom variable
    {
        let mut p = cur;
        let stop = loop {
            if p >= b.len() {
                break None;
            }
            match b[p] {
                b'=' => break Some(p),
                b'<' | b',' => break None,
                _ => p += 1,
            }
        };
        match stop {
            Some(p) => {
                slider.var = line[cur..p].to_string();
                cur = p + 1;
            }
            None => slider.var = format!("slider{}", id),
        }
    }

    if cur < b.len() && b[cur] == b'/' {
        // path slider: `/dir:default:description`, implicitly an enum
        let path_start = cur;
        while cur < b.len() && b[cur] != b':' {
            cur += 1;
        }
        if cur >= b.len() {
            return None;
        }
        slider.path = line[path_start..cur].to_string();
        cur += 1;

        let (def, used) = parse_real_prefix(&line[cur..]);
        slider.def = def;
        cur += used;
        slider.inc = 1.0;
        slider.is_enum = true;

        while cur < b.len() && b[cur] != b':' {
            cur += 1;
        }
        if cur >= b.len() {
            return None;
        }
        cur += 1;
    } else {
        let (def, used) = parse_real_prefix(&line[cur..]);
        slider.def = def;
        cur += used;

        while cur < b.len() && b[cur] != b',' && b[cur] != b'<' {
            cur += 1;
        }
        if cur >= b.len() {
            return None;
        }

        if b[cur] == b',' {
            // no range specification
            cur += 1;
        } else {
            cur += 1;

            let (min, used) = parse_real_prefix(&line[cur..]);
            slider.min = min;
            cur += used;
            while cur < b.len() && b[cur] != b',' && b[cur] != b'>' {
                cur += 1;
            }
            if cur >= b.len() {
                return None;
            }

            if b[cur] == b',' {
                cur += 1;
                let (max, used) = parse_real_prefix(&line[cur..]);
                slider.max = max;
                cur += used;
                while cur < b.len() && b[cur] != b',' && b[cur] != b'>' {
                    cur += 1;
                }
                if cur >= b.len() {
                    return None;
                }
            }

            if b[cur] == b',' {
                cur += 1;
                let (inc, used) = parse_real_prefix(&line[cur..]);
                slider.inc = inc;
                cur += used;
                while cur < b.len() && b[cur] != b'{' && b[cur] != b'>' && b[cur] != b':' {
                    cur += 1;
                }
                if cur >= b.len() {
                    return None;
                }

                if b[cur] == b'{' {
                    cur += 1;
                    let names_start = cur;
                    while cur < b.len() && b[cur] != b'}' && b[cur] != b'>' {
                        cur += 1;
                    }
                    if cur >= b.len() {
                        return None;
                    }
                    slider.is_enum = true;
                    slider.enum_names = line[names_start..cur]
                        .split(',')
                        .filter(|piece| !piece.is_empty())
                        .map(|piece| piece.trim().to_string())
                        .collect();
                }

                if cur < b.len() && b[cur] == b':' {
                    cur += 1;
                    if b[cur..].len() >= 3 && b[cur..cur + 3].eq_ignore_ascii_case(b"log") {
                        slider.shape = SliderShape::Log;
                        cur += 3;
                    } else if b[cur..].len() >= 3 && b[cur..cur + 3].eq_ignore_ascii_case(b"sqr") {
                        slider.shape = SliderShape::Sqr;
                        slider.shape_modifier = 2.0;
                        cur += 3;
                    }

                    if cur < b.len() && b[cur] == b'=' {
                        cur += 1;
                        let (modifier, used) = parse_real_prefix(&line[cur..]);
                        slider.shape_modifier = modifier;
                        cur += used;

                        // a shape whose modifier would make the curve math
                        // blow up degrades to linear
                        if slider.shape_modifier.abs() < 0.0001 {
                            if slider.shape == SliderShape::Sqr {
                                slider.shape = SliderShape::Linear;
                            }
                        } else if (slider.shape_modifier - slider.min).abs() < 0.0000001 {
                            slider.shape = SliderShape::Linear;
                        }
                        if (slider.max - slider.min).abs() < 1e-12 {
                            slider.shape = SliderShape::Linear;
                        }

                        while cur < b.len() && b[cur] != b'>' {
                            cur += 1;
                        }
                        if cur >= b.len() {
                            return None;
                        }
                    }
                }
            }

            while cur < b.len() && b[cur] != b'>' {
                cur += 1;
            }
            if cur >= b.len() {
                return None;
            }
            cur += 1;
        }

        while cur < b.len() && (b[cur] == b',' || is_space(b[cur])) {
            cur += 1;
        }
        if cur >= b.len() {
            return None;
        }
    }

    while cur < b.len() && is_space(b[cur]) {
        cur += 1;
    }
    slider.initially_visible = true;
    if cur < b.len() && b[cur] == b'-' {
        cur += 1;
        slider.initially_visible = false;
    }
    slider.desc = line[cur..].trim().to_string();
    if slider.desc.is_empty() {
        return None;
    }

    Some(slider)
}

/// Parse a `filename:N,name` line.
pub fn parse_filename_line(line: &str) -> Option<(u32, String)> {
    let rest = line.strip_prefix("filename:")?;
    let (value, used) = parse_real_prefix(rest);
    let index = value as i64;
    if index < 0 || index > u32::MAX as i64 {
        return None;
    }
    let b = rest.as_bytes();
    let mut cur = used;
    while cur < b.len() && b[cur] != b',' {
        cur += 1;
    }
    if cur >= b.len() {
        return None;
    }
    cur += 1;
    Some((index as u32, rest[cur..].to_string()))
}

/// Clamp enum slider ranges to `<0, count-1, 1>`, warning on mismatches.
pub fn fix_invalid_enums(sliders: &mut [SliderDef]) {
    for slider in sliders.iter_mut() {
        if !slider.exists || !slider.is_enum {
            continue;
        }
        let count = slider.enum_names.len();
        if count == 0 {
            let is_file = !slider.path.is_empty();
            warn!(
                "slider{}: the enumeration does not contain any {}",
                slider.id + 1,
                if is_file { "files" } else { "items" }
            );
            slider.enum_names.push(String::new());
            slider.min = 0.0;
            slider.max = 0.0;
            slider.inc = 1.0;
        } else if slider.min != 0.0 || slider.inc != 1.0 || slider.max != (count - 1) as Real {
            warn!("slider{}: the enumeration has an invalid range", slider.id + 1);
            slider.min = 0.0;
            slider.max = (count - 1) as Real;
            slider.inc = 1.0;
        }
    }
}
