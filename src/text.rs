//! Line-ending translation for the remote host's text convention.
//!
//! The CADR ends text lines with a return character, octal 215, rather than
//! the host newline. Gateways translate outbound request text with
//! [`newlines_to_cadr`] and inbound reply text with [`cadr_to_newlines`];
//! binary payloads pass through untouched.

/// The CADR return character (0o215).
pub const CADR_RETURN: u8 = 0o215;

/// Replace host line separators with the CADR return character.
pub fn newlines_to_cadr(text: &[u8]) -> Vec<u8> {
    replace(text, line_separator(), &[CADR_RETURN])
}

/// Replace CADR return characters with the host line separator.
pub fn cadr_to_newlines(text: &[u8]) -> Vec<u8> {
    replace(text, &[CADR_RETURN], line_separator())
}

fn line_separator() -> &'static [u8] {
    if cfg!(windows) {
        b"\r\n"
    } else {
        b"\n"
    }
}

fn replace(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest
        .windows(needle.len())
        .position(|window| window == needle)
    {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(with);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_newlines_become_cadr_returns() {
        let translated = newlines_to_cadr(b"GET / HTTP/1.1\nHost: cadr\n\n");
        assert_eq!(
            translated,
            b"GET / HTTP/1.1\x8dHost: cadr\x8d\x8d".to_vec()
        );
    }

    #[test]
    fn inbound_cadr_returns_become_newlines() {
        let translated = cadr_to_newlines(b"HTTP/1.1 200 OK\x8d\x8dhello");
        assert_eq!(translated, b"HTTP/1.1 200 OK\n\nhello".to_vec());
    }

    #[test]
    fn binary_bytes_pass_through() {
        let data = [0x00, 0xff, 0x8c, 0x8e];
        assert_eq!(cadr_to_newlines(&data), data.to_vec());
    }

    #[test]
    fn translation_inverts_on_text() {
        let text = b"line one\nline two\n";
        assert_eq!(cadr_to_newlines(&newlines_to_cadr(text)), text.to_vec());
    }
}
