//! Terminal control-sequence handling for the preview pipeline.
//!
//! Two concerns: stripping escape sequences down to plain text, and scanning
//! raw output for attention signals (bell or OSC notifications) before
//! anything is stripped. Both are small state machines; the OSC
//! classification (progress bars vs. notifications) is why this is not a
//! regex chain.

const ESC: char = '\u{1b}';
const BEL: char = '\u{07}';

/// Scan raw terminal output for an attention signal.
///
/// Returns true when the stream contains a non-progress OSC 9, an OSC 99 or
/// OSC 777 notification, or a BEL outside of any OSC sequence. iTerm-style
/// progress frames (`ESC ] 9 ; 4 ; ...`) do not count.
pub fn contains_attention(data: &str) -> bool {
    enum State {
        Normal,
        Escape,
        Csi,
        Osc(String),
        OscEsc(String),
    }

    let mut state = State::Normal;
    for ch in data.chars() {
        state = match state {
            State::Normal => match ch {
                ESC => State::Escape,
                BEL => return true,
                _ => State::Normal,
            },
            State::Escape => match ch {
                ']' => State::Osc(String::new()),
                '[' => State::Csi,
                ESC => State::Escape,
                _ => State::Normal,
            },
            State::Csi => {
                if ('\u{40}'..='\u{7e}').contains(&ch) {
                    State::Normal
                } else {
                    State::Csi
                }
            }
            State::Osc(mut payload) => match ch {
                BEL => {
                    if osc_is_attention(&payload) {
                        return true;
                    }
                    State::Normal
                }
                ESC => State::OscEsc(payload),
                _ => {
                    payload.push(ch);
                    State::Osc(payload)
                }
            },
            State::OscEsc(payload) => match ch {
                '\\' => {
                    if osc_is_attention(&payload) {
                        return true;
                    }
                    State::Normal
                }
                _ => State::Osc(payload),
            },
        };
    }

    // An unterminated OSC at the end of a chunk is classified as-is; the
    // command number is always in the first few bytes.
    match state {
        State::Osc(payload) | State::OscEsc(payload) => osc_is_attention(&payload),
        _ => false,
    }
}

/// Classify an OSC payload (everything between `ESC ]` and the terminator).
fn osc_is_attention(payload: &str) -> bool {
    let number = payload.split(';').next().unwrap_or("");
    match number {
        "9" => {
            // OSC 9;4;... is the iTerm progress-bar protocol, not a
            // notification.
            let rest = payload.strip_prefix("9;").unwrap_or("");
            !(rest == "4" || rest.starts_with("4;"))
        }
        "99" | "777" => true,
        _ => false,
    }
}

/// Strip terminal control sequences, leaving printable text and newlines.
///
/// Removes CSI sequences, OSC sequences (BEL- or ST-terminated), two-byte
/// escapes such as character-set designators, lone single-character escapes,
/// bare carriage returns, and bell characters. Idempotent on its own output.
pub fn strip_ansi(input: &str) -> String {
    enum State {
        Normal,
        Escape,
        Csi,
        Osc,
        OscEsc,
        Charset,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Normal;

    for ch in input.chars() {
        state = match state {
            State::Normal => match ch {
                ESC => State::Escape,
                '\r' | BEL => State::Normal,
                _ => {
                    out.push(ch);
                    State::Normal
                }
            },
            State::Escape => match ch {
                '[' => State::Csi,
                ']' => State::Osc,
                '(' | ')' | '*' | '+' | '#' | '%' => State::Charset,
                ESC => State::Escape,
                _ => State::Normal,
            },
            State::Csi => {
                if ('\u{40}'..='\u{7e}').contains(&ch) {
                    State::Normal
                } else {
                    State::Csi
                }
            }
            State::Osc => match ch {
                BEL => State::Normal,
                ESC => State::OscEsc,
                _ => State::Osc,
            },
            State::OscEsc => match ch {
                '\\' => State::Normal,
                _ => State::Osc,
            },
            State::Charset => State::Normal,
        };
    }

    out
}
