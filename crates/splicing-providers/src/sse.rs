/// Removes every complete server-sent-event frame from `buffer` and returns
/// the `data:` payloads in arrival order. Incomplete trailing frames stay in
/// the buffer for the next network chunk.
pub(crate) fn drain_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    loop {
        let normalized = buffer.find("\r\n\r\n").map(|pos| (pos, 4));
        let plain = buffer.find("\n\n").map(|pos| (pos, 2));
        let Some((pos, sep_len)) = [normalized, plain].into_iter().flatten().min() else {
            break;
        };
        let frame = buffer[..pos].to_string();
        buffer.drain(..pos + sep_len);
        for line in frame.lines() {
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if !payload.is_empty() {
                payloads.push(payload.to_string());
            }
        }
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_partial_frames_buffered() {
        let mut buffer = String::from("event: x\ndata: {\"a\":1}\n\ndata: {\"b\"");
        assert_eq!(drain_data_payloads(&mut buffer), vec!["{\"a\":1}"]);
        assert_eq!(buffer, "data: {\"b\"");

        buffer.push_str(":2}\n\ndata: [DONE]\n\n");
        assert_eq!(
            drain_data_payloads(&mut buffer),
            vec!["{\"b\":2}", "[DONE]"]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn accepts_crlf_separators() {
        let mut buffer = String::from("data: one\r\n\r\ndata: two\n\n");
        assert_eq!(drain_data_payloads(&mut buffer), vec!["one", "two"]);
    }
}
