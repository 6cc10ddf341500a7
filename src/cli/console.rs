//! Line-oriented operator console for `trainforge serve`.

use std::str::FromStr;

use anyhow::{anyhow, bail, Context};

/// Help text printed by the `help` command.
pub const HELP: &str = "\
Commands:
  train <project>                              start a training run in the background
  pause <project>                              pause the training container
  resume <project>                             resume a paused training container
  halt <project>                               kill the training container
  export <project> <checkpoint> <name...>      export the checkpoint written at an epoch
  test <project> <export> <video> <name...>    run an export against a video
  status [project]                             show training status
  checkpoints|exports|videos|tests <project>   list project artifacts
  readiness                                    show readiness history
  metrics                                      print Prometheus metrics
  help                                         show this help
  quit                                         stop the service";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Train { project: String },
    Pause { project: String },
    Resume { project: String },
    Halt { project: String },
    Export {
        project: String,
        checkpoint: u32,
        name: String,
    },
    Test {
        project: String,
        export: String,
        video: String,
        name: String,
    },
    Status { project: Option<String> },
    Checkpoints { project: String },
    Exports { project: String },
    Videos { project: String },
    Tests { project: String },
    Readiness,
    Metrics,
    Help,
    Quit,
}

fn take<'a>(args: &mut impl Iterator<Item = &'a str>, what: &str) -> anyhow::Result<String> {
    args.next()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing <{what}>"))
}

fn rest<'a>(args: impl Iterator<Item = &'a str>, what: &str) -> anyhow::Result<String> {
    let joined = args.collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        bail!("missing <{what}>");
    }
    Ok(joined)
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut args = line.split_whitespace();
        let Some(verb) = args.next() else {
            bail!("empty command");
        };

        let command = match verb.to_lowercase().as_str() {
            "train" | "start" => Self::Train {
                project: take(&mut args, "project")?,
            },
            "pause" => Self::Pause {
                project: take(&mut args, "project")?,
            },
            "resume" => Self::Resume {
                project: take(&mut args, "project")?,
            },
            "halt" | "stop" => Self::Halt {
                project: take(&mut args, "project")?,
            },
            "export" => {
                let project = take(&mut args, "project")?;
                let checkpoint = take(&mut args, "checkpoint")?;
                let checkpoint = checkpoint
                    .parse()
                    .with_context(|| format!("invalid checkpoint '{checkpoint}'"))?;
                Self::Export {
                    project,
                    checkpoint,
                    name: rest(args, "name")?,
                }
            }
            "test" => Self::Test {
                project: take(&mut args, "project")?,
                export: take(&mut args, "export")?,
                video: take(&mut args, "video")?,
                name: rest(args, "name")?,
            },
            "status" => Self::Status {
                project: args.next().map(str::to_string),
            },
            "checkpoints" => Self::Checkpoints {
                project: take(&mut args, "project")?,
            },
            "exports" => Self::Exports {
                project: take(&mut args, "project")?,
            },
            "videos" => Self::Videos {
                project: take(&mut args, "project")?,
            },
            "tests" => Self::Tests {
                project: take(&mut args, "project")?,
            },
            "readiness" => Self::Readiness,
            "metrics" => Self::Metrics,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{other}' (try 'help')"),
        };

        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_commands() {
        assert_eq!(
            "train mice".parse::<ConsoleCommand>().expect("parse"),
            ConsoleCommand::Train {
                project: "mice".to_string()
            }
        );
        assert_eq!(
            "  HALT   mice ".parse::<ConsoleCommand>().expect("parse"),
            ConsoleCommand::Halt {
                project: "mice".to_string()
            }
        );
        assert_eq!(
            "status".parse::<ConsoleCommand>().expect("parse"),
            ConsoleCommand::Status { project: None }
        );
    }

    #[test]
    fn test_parse_names_with_spaces() {
        let export: ConsoleCommand = "export mice 40 release candidate".parse().expect("parse");
        assert_eq!(
            export,
            ConsoleCommand::Export {
                project: "mice".to_string(),
                checkpoint: 40,
                name: "release candidate".to_string(),
            }
        );

        let test: ConsoleCommand = "test mice e1 v1 night shift".parse().expect("parse");
        assert!(matches!(test, ConsoleCommand::Test { ref name, .. } if name == "night shift"));
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<ConsoleCommand>().is_err());
        assert!("pause".parse::<ConsoleCommand>().is_err());
        assert!("export mice latest final".parse::<ConsoleCommand>().is_err());
        assert!("export mice 40".parse::<ConsoleCommand>().is_err());
        assert!("launch mice".parse::<ConsoleCommand>().is_err());
    }
}
