/* Copyright 2026- The Courier team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Command Line Interface
use once_cell::sync::Lazy;

/// The parsed command-line arguments provided to this program. Lazily
/// initialized.
///
/// # Exits
///
/// Exits if [`argh::from_env`] would exit--for example, if the `--help`
/// flag was provided or the program arguments could not be parsed.
pub static PARSED_COMMANDS: Lazy<TopLevel> = Lazy::new(argh::from_env);

/// Toplevel CLI commands and options.
/// Subcommands are optional.
/// If no command is provided "serve" will be invoked with default options.
#[derive(argh::FromArgs, PartialEq, Debug)]
pub struct TopLevel {
    /// subcommands
    #[argh(subcommand)]
    pub subcommand: Option<Command>,
}

/// Subcommands
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Command {
    /// starts the relay.
    Serve(Serve),

    /// prints the courier version to stdout.
    Version(Version),

    /// generates the openapi spec and exits.
    Oasgen(Oasgen),
}

/// Starts the relay. This is the default command when no command is
/// provided.
#[derive(argh::FromArgs, PartialEq, Debug, Default)]
#[argh(subcommand, name = "serve")]
pub struct Serve {
    /// if present, the host:port to bind instead of `COURIER_BIND`, e.g.
    /// `courier serve -b 0.0.0.0:8080`.
    #[argh(option, short = 'b')]
    pub bind: Option<String>,

    /// if present, the SQLite database path instead of `COURIER_DB`.
    #[argh(option, short = 'd')]
    pub database: Option<String>,
}

/// Prints the courier version to stdout.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "version")]
pub struct Version {}

/// Generates the Courier OpenAPI specification.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "oasgen")]
pub struct Oasgen {
    /// if present, courier will generate the OpenAPI spec in JSON format;
    /// the default behavior is to generate yaml output.
    #[argh(switch, short = 'j')]
    pub json: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use argh::FromArgs;

    #[test]
    fn version() {
        assert_eq!(
            TopLevel::from_args(&["courier"], &["version"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Version(Version {}))
            }
        );
    }

    #[test]
    fn serve_only() {
        assert_eq!(
            TopLevel::from_args(&["courier"], &["serve"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve {
                    bind: None,
                    database: None,
                }))
            }
        );
    }

    #[test]
    fn serve_with_bind_and_database() {
        assert_eq!(
            TopLevel::from_args(
                &["courier"],
                &["serve", "-b", "0.0.0.0:9000", "--database", "relay.db"]
            )
            .expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve {
                    bind: Some("0.0.0.0:9000".to_string()),
                    database: Some("relay.db".to_string()),
                }))
            }
        );
    }

    #[test]
    fn oasgen_json() {
        assert_eq!(
            TopLevel::from_args(&["courier"], &["oasgen", "-j"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Oasgen(Oasgen { json: true }))
            }
        );
    }

    #[test]
    fn no_subcommand_defaults_to_serve() {
        assert_eq!(
            TopLevel::from_args(&["courier"], &[]).expect("from_args failed"),
            TopLevel { subcommand: None }
        );
    }
}
