//! Validation of untrusted dex paths and class loader contexts reported by apps

use super::model::UNSUPPORTED_CLASS_LOADER_CONTEXT;

const CLASS_LOADER_TYPES: [&str; 3] = ["PCL", "DLC", "IMC"];

/// Check that `dex_path` is an absolute, normalized path
pub fn validate_dex_path(dex_path: &str) -> Result<(), String> {
    if dex_path.is_empty() {
        return Err("Dex path must not be empty".to_string());
    }
    if !dex_path.starts_with('/') {
        return Err(format!("Dex path '{}' must be absolute", dex_path));
    }
    if dex_path.contains('\0') {
        return Err(format!("Dex path '{}' must not contain NUL", dex_path.escape_debug()));
    }
    let normalized = dex_path[1..]
        .split('/')
        .all(|part| !part.is_empty() && part != "." && part != "..");
    if !normalized {
        return Err(format!("Dex path '{}' must be normalized", dex_path));
    }
    Ok(())
}

/// Check that `context` parses as a class loader context
pub fn validate_class_loader_context(dex_path: &str, context: &str) -> Result<(), String> {
    if context == UNSUPPORTED_CLASS_LOADER_CONTEXT {
        return Ok(());
    }
    let mut parser = Parser {
        input: context.as_bytes(),
        position: 0,
    };
    parser
        .parse_context()
        .and_then(|_| {
            if parser.position == parser.input.len() {
                Ok(())
            } else {
                Err(parser.position)
            }
        })
        .map_err(|offset| {
            format!(
                "Class loader context '{}' is invalid for '{}' (at offset {})",
                context, dex_path, offset
            )
        })
}

struct Parser<'a> {
    input: &'a [u8],
    position: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), usize> {
        if self.peek() == Some(byte) {
            self.position += 1;
            Ok(())
        } else {
            Err(self.position)
        }
    }

    // context := loader (';' loader)*
    fn parse_context(&mut self) -> Result<(), usize> {
        self.parse_loader()?;
        while self.peek() == Some(b';') {
            self.position += 1;
            self.parse_loader()?;
        }
        Ok(())
    }

    // loader := TYPE '[' classpath ']' ('{' context ('#' context)* '}')?
    fn parse_loader(&mut self) -> Result<(), usize> {
        let rest = &self.input[self.position..];
        let kind = CLASS_LOADER_TYPES
            .iter()
            .find(|kind| rest.starts_with(kind.as_bytes()))
            .ok_or(self.position)?;
        self.position += kind.len();

        self.expect(b'[')?;
        while let Some(byte) = self.peek() {
            if matches!(byte, b']' | b'[' | b'{' | b'}' | b';' | b'#') {
                break;
            }
            self.position += 1;
        }
        self.expect(b']')?;

        if self.peek() == Some(b'{') {
            self.position += 1;
            self.parse_context()?;
            while self.peek() == Some(b'#') {
                self.position += 1;
                self.parse_context()?;
            }
            self.expect(b'}')?;
        }
        Ok(())
    }
}
