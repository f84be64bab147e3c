/// A directory change recognized in a line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CwdCommand {
    /// `cd`/`chdir`. An empty target means "no argument".
    Cd { target: String },
    Pushd { target: String },
    Popd,
}

/// Classify one line of shell input. Only the first command of a compound
/// line (`a && b`, `a & b`, `a; b`) is considered.
pub fn parse_cwd_command(line: &str) -> Option<CwdCommand> {
    let segment = first_segment(line);
    if segment.is_empty() {
        return None;
    }

    if let Some(letter) = drive_letter(segment) {
        return Some(CwdCommand::Cd {
            target: format!("{letter}:\\"),
        });
    }

    let (word, rest) = match segment.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (segment, ""),
    };
    if word.eq_ignore_ascii_case("pushd") {
        let target = unquote(rest);
        if target.is_empty() {
            return None;
        }
        return Some(CwdCommand::Pushd {
            target: target.to_string(),
        });
    }
    if word.eq_ignore_ascii_case("popd") {
        return Some(CwdCommand::Popd);
    }

    let after = strip_prefix_ignore_case(segment, "chdir")
        .or_else(|| strip_prefix_ignore_case(segment, "cd"))?;

    if after.is_empty() || after.starts_with(char::is_whitespace) {
        return Some(CwdCommand::Cd {
            target: general_target(after),
        });
    }

    // No space between the command and its argument.
    match after {
        ".." | "." | "/" | "\\" => Some(CwdCommand::Cd {
            target: after.to_string(),
        }),
        _ if after.starts_with(['/', '\\', '.', '~', '"', '\'']) => Some(CwdCommand::Cd {
            target: general_target(after),
        }),
        _ => None,
    }
}

/// Up to the first `&` or `;` outside quotes.
fn first_segment(line: &str) -> &str {
    let mut quote = None;
    let end = line
        .char_indices()
        .find(|&(_, c)| match quote {
            Some(open) => {
                if c == open {
                    quote = None;
                }
                false
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                false
            }
            None => c == '&' || c == ';',
        })
        .map_or(line.len(), |(i, _)| i);
    line[..end].trim()
}

fn drive_letter(segment: &str) -> Option<char> {
    let mut chars = segment.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(letter), Some(':'), None) if letter.is_ascii_alphabetic() => {
            Some(letter.to_ascii_uppercase())
        }
        _ => None,
    }
}

/// `[/d] [target]` with surrounding quotes removed.
fn general_target(args: &str) -> String {
    let mut args = args.trim();
    if let Some(rest) = strip_prefix_ignore_case(args, "/d")
        && (rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        args = rest.trim_start();
    }
    unquote(args).to_string()
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
