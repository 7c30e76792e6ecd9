//! Size-bounded chunking for downstream LLM calls.

use crate::textprep::char_len;

/// Default chunk ceiling, in characters.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 29_000;

const SECTION_SEP: &str = "\n\n";

/// Hard-split `text` into pieces of at most `max_chars` characters.
///
/// Splits happen after a newline whenever possible; a single line longer than
/// the ceiling is cut on character boundaries. The pieces concatenate back to
/// exactly `text`.
pub fn split_hard(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if char_len(text) <= max_chars {
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![text.to_string()]
        };
    }

    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;
    for line in text.split_inclusive('\n') {
        let line_chars = char_len(line);
        if current_chars + line_chars <= max_chars {
            current.push_str(line);
            current_chars += line_chars;
            continue;
        }
        if !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if line_chars <= max_chars {
            current.push_str(line);
            current_chars = line_chars;
            continue;
        }
        // Oversized single line.
        let mut piece = String::new();
        let mut piece_chars = 0usize;
        for ch in line.chars() {
            piece.push(ch);
            piece_chars += 1;
            if piece_chars == max_chars {
                out.push(std::mem::take(&mut piece));
                piece_chars = 0;
            }
        }
        current = piece;
        current_chars = piece_chars;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Pack sections into chunks of at most `max_chars` characters.
///
/// Sections are joined with a blank line while they fit; an oversized section
/// is hard-split with [`split_hard`] and each piece becomes its own chunk.
/// Order is preserved.
pub fn pack_chunks(sections: &[String], max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let sep_chars = char_len(SECTION_SEP);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for section in sections {
        if section.trim().is_empty() {
            continue;
        }
        let section_chars = char_len(section);
        if section_chars > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            out.extend(split_hard(section, max_chars));
            continue;
        }
        if current.is_empty() {
            current.push_str(section);
            current_chars = section_chars;
        } else if current_chars + sep_chars + section_chars <= max_chars {
            current.push_str(SECTION_SEP);
            current.push_str(section);
            current_chars += sep_chars + section_chars;
        } else {
            out.push(std::mem::take(&mut current));
            current.push_str(section);
            current_chars = section_chars;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
