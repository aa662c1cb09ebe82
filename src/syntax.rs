//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version  3 of the License, or  (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// (HELO|EHLO) origin-host ignored...
    Helo { extended: bool, domain: String },
    /// MAIL FROM:<return-path> [SIZE=sz] [BODY=encoding]
    Mail { from: String, size: Option<u64> },
    /// RCPT TO:<forward-path>
    Rcpt { to: String },
    /// AUTH mechanism [initial-response]
    ///
    /// `mechanism` is empty when the client sent a bare `AUTH`; the engine
    /// answers that with a sequence error rather than a parse error.
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// DATA
    Data,
    /// RSET
    Reset,
    /// NOOP ignored...
    Noop,
    /// VRFY ignored...
    Verify,
    /// QUIT
    Quit,
    /// STARTTLS
    StartTls,
    /// A verb we recognize but deliberately do not serve.
    Unimplemented(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The line was empty or all whitespace.
    Empty,
    /// The verb itself is not recognized. These count toward the
    /// unknown-command limit.
    Unrecognized(String),
    /// A known verb with malformed arguments; answered with a 501 carrying
    /// the given text.
    Syntax(&'static str),
}

lazy_static! {
    // Matches FROM, while accepting '>' as a quoted pair and in double
    // quoted strings.
    static ref RX_MAIL_FROM: Regex = Regex::new(
        r#"(?i)^FROM:\s*<((?:\\>|[^>])+|"[^"]+"@[^>]+)>( [\w= ]+)?$"#
    )
    .unwrap();
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let line = s.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (verb, arg) = match line.find(char::is_whitespace) {
            Some(ix) => (&line[..ix], line[ix..].trim_start()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => parse_helo(false, arg),
            "EHLO" => parse_helo(true, arg),
            "MAIL" => parse_mail(arg),
            "RCPT" => parse_rcpt(arg),
            "AUTH" => Ok(parse_auth(arg)),
            "DATA" => {
                if arg.is_empty() {
                    Ok(Command::Data)
                } else {
                    Err(ParseError::Syntax(
                        "DATA command should not have any arguments",
                    ))
                }
            },
            "RSET" => Ok(Command::Reset),
            "NOOP" => Ok(Command::Noop),
            "VRFY" => Ok(Command::Verify),
            "QUIT" => Ok(Command::Quit),
            "STARTTLS" => Ok(Command::StartTls),
            v @ ("SEND" | "SOML" | "SAML" | "EXPN" | "HELP" | "TURN") => {
                Ok(Command::Unimplemented(v.to_owned()))
            },
            v => Err(ParseError::Unrecognized(v.to_owned())),
        }
    }
}

fn parse_helo(extended: bool, arg: &str) -> Result<Command, ParseError> {
    match arg.split_whitespace().next() {
        Some(domain) => Ok(Command::Helo {
            extended,
            domain: domain.to_owned(),
        }),
        None => Err(ParseError::Syntax(if extended {
            "Domain/address argument required for EHLO"
        } else {
            "Domain/address argument required for HELO"
        })),
    }
}

fn parse_mail(arg: &str) -> Result<Command, ParseError> {
    let Some(cap) = RX_MAIL_FROM.captures(arg) else {
        return Err(ParseError::Syntax(
            "Was expecting MAIL arg syntax of FROM:<address>",
        ));
    };

    let from = cap.get(1).map_or("", |m| m.as_str()).to_owned();

    let mut size = None::<u64>;
    for token in cap
        .get(2)
        .map_or("", |m| m.as_str())
        .split(' ')
        .filter(|t| !t.is_empty())
    {
        let Some((key, value)) = token.split_once('=') else {
            return Err(ParseError::Syntax(
                "Unable to parse MAIL ESMTP parameters",
            ));
        };

        // BODY=8BITMIME may show up here, but the data is captured as raw
        // bytes either way, so it does not affect our processing.
        if key.eq_ignore_ascii_case("SIZE") && !value.is_empty() {
            match value.parse::<i32>() {
                Ok(sz) => size = Some(sz as u64),
                Err(_) => {
                    return Err(ParseError::Syntax(
                        "Unable to parse SIZE as an integer",
                    ));
                },
            }
        }
    }

    Ok(Command::Mail { from, size })
}

fn parse_rcpt(arg: &str) -> Result<Command, ParseError> {
    let bytes = arg.as_bytes();
    if bytes.len() < 4 || !bytes[..3].eq_ignore_ascii_case(b"TO:") {
        return Err(ParseError::Syntax(
            "Was expecting RCPT arg syntax of TO:<address>",
        ));
    }

    // TODO This trim is probably too forgiving
    let to = arg[3..]
        .trim_matches(|c| c == '<' || c == '>' || c == ' ')
        .to_owned();
    Ok(Command::Rcpt { to })
}

fn parse_auth(arg: &str) -> Command {
    let mut fields = arg.split_whitespace();
    Command::Auth {
        mechanism: fields.next().unwrap_or("").to_owned(),
        initial: fields.next().map(str::to_owned),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn helo_parsing() {
        assert_eq!(
            Ok(Command::Helo {
                extended: false,
                domain: "foo.example.com".to_owned(),
            }),
            "HELO foo.example.com".parse()
        );
        assert_eq!(
            Ok(Command::Helo {
                extended: false,
                domain: "foo.example.com".to_owned(),
            }),
            "helo foo.example.com some client implementation".parse()
        );
        assert_eq!(
            Ok(Command::Helo {
                extended: true,
                domain: "foo.example.com".to_owned(),
            }),
            "EHLO foo.example.com".parse()
        );
        assert_eq!(
            Err(ParseError::Syntax(
                "Domain/address argument required for HELO"
            )),
            "HELO".parse::<Command>()
        );
        assert_eq!(
            Err(ParseError::Syntax(
                "Domain/address argument required for EHLO"
            )),
            "EHLO   ".parse::<Command>()
        );
    }

    #[test]
    fn mail_parsing() {
        assert_eq!(
            Ok(Command::Mail {
                from: "foo@bar.com".to_owned(),
                size: None,
            }),
            "MAIL FROM:<foo@bar.com>".parse()
        );
        assert_eq!(
            Ok(Command::Mail {
                from: "foo@bar.com".to_owned(),
                size: None,
            }),
            "mail from:<foo@bar.com> BODY=8BITMIME".parse()
        );
        assert_eq!(
            Ok(Command::Mail {
                from: "foo@bar.com".to_owned(),
                size: Some(42),
            }),
            "MAIL FROM:<foo@bar.com> SIZE=42".parse()
        );
        assert_eq!(
            Ok(Command::Mail {
                from: "foo@bar.com".to_owned(),
                size: Some(42),
            }),
            "MAIL FROM:<foo@bar.com> body=7bit size=42".parse()
        );
        // '>' is accepted as a quoted pair and in quoted strings
        assert_eq!(
            Ok(Command::Mail {
                from: r"foo\>bar@bar.com".to_owned(),
                size: None,
            }),
            r"MAIL FROM:<foo\>bar@bar.com>".parse()
        );
        assert_eq!(
            Ok(Command::Mail {
                from: "\"foo bar\"@bar.com".to_owned(),
                size: None,
            }),
            "MAIL FROM:<\"foo bar\"@bar.com>".parse()
        );

        assert_eq!(
            Err(ParseError::Syntax(
                "Was expecting MAIL arg syntax of FROM:<address>"
            )),
            "MAIL FROM:<>".parse::<Command>()
        );
        assert_eq!(
            Err(ParseError::Syntax(
                "Was expecting MAIL arg syntax of FROM:<address>"
            )),
            "MAIL TO:<foo@bar.com>".parse::<Command>()
        );
        assert_eq!(
            Err(ParseError::Syntax(
                "Unable to parse MAIL ESMTP parameters"
            )),
            "MAIL FROM:<foo@bar.com> SIZE".parse::<Command>()
        );
        assert_eq!(
            Err(ParseError::Syntax("Unable to parse SIZE as an integer")),
            "MAIL FROM:<foo@bar.com> SIZE=99999999999999999999"
                .parse::<Command>()
        );
    }

    #[test]
    fn rcpt_parsing() {
        assert_eq!(
            Ok(Command::Rcpt {
                to: "userc@d.bar.org".to_owned(),
            }),
            "RCPT TO:<userc@d.bar.org>".parse()
        );
        assert_eq!(
            Ok(Command::Rcpt {
                to: "userc@d.bar.org".to_owned(),
            }),
            "rcpt to:<userc@d.bar.org>".parse()
        );
        // The lenient trim accepts a bare address too
        assert_eq!(
            Ok(Command::Rcpt {
                to: "alice@example.com".to_owned(),
            }),
            "RCPT TO: alice@example.com".parse()
        );
        assert_eq!(
            Err(ParseError::Syntax(
                "Was expecting RCPT arg syntax of TO:<address>"
            )),
            "RCPT TO:".parse::<Command>()
        );
        assert_eq!(
            Err(ParseError::Syntax(
                "Was expecting RCPT arg syntax of TO:<address>"
            )),
            "RCPT FROM:<foo@bar.com>".parse::<Command>()
        );
    }

    #[test]
    fn auth_parsing() {
        assert_eq!(
            Ok(Command::Auth {
                mechanism: "PLAIN".to_owned(),
                initial: Some("AGF6dXJlAGh1bnRlcjI=".to_owned()),
            }),
            "AUTH PLAIN AGF6dXJlAGh1bnRlcjI=".parse()
        );
        assert_eq!(
            Ok(Command::Auth {
                mechanism: "login".to_owned(),
                initial: None,
            }),
            "AUTH login".parse()
        );
        assert_eq!(
            Ok(Command::Auth {
                mechanism: String::new(),
                initial: None,
            }),
            "AUTH".parse()
        );
    }

    #[test]
    fn simple_commands() {
        assert_eq!(Ok(Command::Data), "DATA".parse());
        assert_eq!(Ok(Command::Data), "data".parse());
        assert_eq!(
            Err(ParseError::Syntax(
                "DATA command should not have any arguments"
            )),
            "DATA NOW".parse::<Command>()
        );

        assert_eq!(Ok(Command::Reset), "RSET".parse());
        assert_eq!(Ok(Command::Noop), "NOOP".parse());
        assert_eq!(Ok(Command::Verify), "VRFY Smith".parse());
        assert_eq!(Ok(Command::Quit), "QUIT".parse());
        assert_eq!(Ok(Command::StartTls), "STARTTLS".parse());

        assert_eq!(
            Ok(Command::Unimplemented("HELP".to_owned())),
            "help me".parse()
        );
        assert_eq!(
            Ok(Command::Unimplemented("TURN".to_owned())),
            "TURN".parse()
        );

        assert_eq!(Err(ParseError::Empty), "".parse::<Command>());
        assert_eq!(Err(ParseError::Empty), "   ".parse::<Command>());
        assert_eq!(
            Err(ParseError::Unrecognized("FOOBAR".to_owned())),
            "FOOBAR baz".parse::<Command>()
        );
        assert_eq!(
            Err(ParseError::Unrecognized("DATABASE".to_owned())),
            "DATABASE".parse::<Command>()
        );
    }
}
