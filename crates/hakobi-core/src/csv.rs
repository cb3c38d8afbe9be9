//! CSV line encoding.
//!
//! RFC 4180 quoting: a field is quoted only when it contains a comma, quote,
//! CR or LF; quotes are doubled. Rows are appended to a caller-owned buffer
//! so the upload path can recycle allocations while streaming.

/// Append one encoded row (with trailing `\r\n`) to `buf`.
///
/// `None` renders as an empty field.
pub fn encode_row(fields: &[Option<String>], buf: &mut Vec<u8>) {
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            buf.push(b',');
        }
        if let Some(value) = field {
            encode_field(value, buf);
        }
    }
    buf.extend_from_slice(b"\r\n");
}

/// Append the header row for `columns` to `buf`.
pub fn encode_header(columns: &[String], buf: &mut Vec<u8>) {
    for (idx, column) in columns.iter().enumerate() {
        if idx > 0 {
            buf.push(b',');
        }
        encode_field(column, buf);
    }
    buf.extend_from_slice(b"\r\n");
}

fn encode_field(value: &str, buf: &mut Vec<u8>) {
    if !needs_quoting(value) {
        buf.extend_from_slice(value.as_bytes());
        return;
    }
    buf.push(b'"');
    for byte in value.bytes() {
        if byte == b'"' {
            buf.push(b'"');
        }
        buf.push(byte);
    }
    buf.push(b'"');
}

fn needs_quoting(value: &str) -> bool {
    value
        .bytes()
        .any(|b| matches!(b, b',' | b'"' | b'\n' | b'\r'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[Option<&str>]) -> String {
        let fields: Vec<Option<String>> =
            fields.iter().map(|f| f.map(|s| s.to_string())).collect();
        let mut buf = Vec::new();
        encode_row(&fields, &mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn plain_fields_are_not_quoted() {
        assert_eq!(row(&[Some("ABC"), Some("1.5")]), "ABC,1.5\r\n");
    }

    #[test]
    fn null_renders_empty() {
        assert_eq!(row(&[Some("a"), None, Some("c")]), "a,,c\r\n");
    }

    #[test]
    fn separators_and_quotes_force_quoting() {
        assert_eq!(row(&[Some("a,b")]), "\"a,b\"\r\n");
        assert_eq!(row(&[Some("say \"hi\"")]), "\"say \"\"hi\"\"\"\r\n");
        assert_eq!(row(&[Some("line\nbreak")]), "\"line\nbreak\"\r\n");
    }

    #[test]
    fn header_is_encoded_like_a_row() {
        let mut buf = Vec::new();
        encode_header(&["key".to_string(), "close,price".to_string()], &mut buf);
        assert_eq!(String::from_utf8(buf).unwrap(), "key,\"close,price\"\r\n");
    }
}
