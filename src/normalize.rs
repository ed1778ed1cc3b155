use unicode_normalization::UnicodeNormalization;

use crate::types::ErrorKind;

/// Zero-width and directional format characters that survive NFKD and are
/// routinely used to split tokens past substring checks.
fn is_format_char(c: char) -> bool {
    matches!(c,
        '\u{200b}'..='\u{200f}'   // ZWSP, ZWNJ, ZWJ, LRM, RLM
        | '\u{2028}'..='\u{202f}' // line/para separators, directional embeds
        | '\u{2060}'..='\u{2064}' // word joiner, invisible operators
        | '\u{feff}'              // BOM
    )
}

/// Canonicalize a raw command string before any security check runs.
///
/// NFKD decomposition folds homoglyphs and compatibility forms back to
/// ASCII, format characters are deleted, and any residual non-ASCII byte
/// is a hard failure. Later phases only ever see the canonical form.
pub fn normalize_command(raw: &str) -> Result<String, ErrorKind> {
    let decomposed: String = raw
        .chars()
        .filter(|c| !is_format_char(*c))
        .nfkd()
        .filter(|c| !is_format_char(*c))
        .collect();

    if decomposed.chars().any(|c| !c.is_ascii()) {
        return Err(ErrorKind::NonAsciiCommand);
    }

    // Backslash-newline continuations would otherwise let one logical
    // command span several scanned lines.
    let joined = decomposed.replace("\\\n", "");

    let mut out = String::with_capacity(joined.len());
    let mut in_space = true;
    for c in joined.chars() {
        if c.is_ascii_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::normalize_command;
    use crate::types::ErrorKind;

    #[test]
    fn zero_width_characters_are_stripped() {
        let cmd = "git\u{200b} sta\u{200d}tus";
        assert_eq!(normalize_command(cmd).expect("normalize"), "git status");
    }

    #[test]
    fn fullwidth_homoglyphs_fold_to_ascii() {
        // U+FF50 FULLWIDTH LATIN SMALL LETTER P decomposes to 'p' under NFKD.
        let cmd = "\u{ff50}ython script.py";
        assert_eq!(normalize_command(cmd).expect("normalize"), "python script.py");
    }

    #[test]
    fn residual_non_ascii_is_rejected() {
        // Cyrillic 'о' does not decompose to ASCII.
        let cmd = "pyth\u{043e}n -c 'x'";
        assert_eq!(normalize_command(cmd), Err(ErrorKind::NonAsciiCommand));
    }

    #[test]
    fn whitespace_collapses_and_continuations_join() {
        assert_eq!(
            normalize_command("ls   -la\t .").expect("normalize"),
            "ls -la ."
        );
        assert_eq!(
            normalize_command("git \\\nstatus").expect("normalize"),
            "git status"
        );
    }

    #[test]
    fn plain_ascii_passes_through() {
        assert_eq!(
            normalize_command("cat notes.txt").expect("normalize"),
            "cat notes.txt"
        );
    }
}
