//! Hard limits of the compiler and bytecode format, plus chunk-name
//! formatting for error prefixes.

/// Maximum number of variable declarations per function (must stay below
/// 250 because of the bytecode format).
pub const MAX_VARS: usize = 200;

/// Maximum number of upvalues per function (fits in one byte).
pub const MAX_UPVAL: usize = 255;

/// Maximum nesting depth for the recursive-descent parser.
pub const MAX_PARSER_DEPTH: usize = 200;

/// Maximum length shown for a literal chunk name inside `[string "..."]`.
const ID_LEN: usize = 45;

/// Format a chunk name the way error prefixes expect it:
/// `@file` becomes `file`, `=name` becomes `name`, and a literal chunk
/// becomes `[string "first line..."]`.
pub fn chunk_id(name: &str) -> String {
    match name.as_bytes().first() {
        Some(b'=') => name[1..].chars().take(ID_LEN).collect(),
        Some(b'@') => {
            let file = &name[1..];
            if file.len() <= ID_LEN {
                file.to_string()
            } else {
                format!("...{}", &file[file.len() - ID_LEN..])
            }
        }
        _ => {
            let line = name.lines().next().unwrap_or("");
            let truncated = line.len() > ID_LEN || name.lines().count() > 1;
            let shown: String = line.chars().take(ID_LEN).collect();
            if truncated {
                format!("[string \"{}...\"]", shown)
            } else {
                format!("[string \"{}\"]", shown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chunk_id_forms() {
        assert_eq!(chunk_id("@script.luna"), "script.luna");
        assert_eq!(chunk_id("=stdin"), "stdin");
        assert_eq!(chunk_id("return 1"), "[string \"return 1\"]");
    }

    #[test]
    fn literal_chunk_truncates_at_newline() {
        assert_eq!(chunk_id("local a\nlocal b"), "[string \"local a...\"]");
    }
}
