//! REPL (Read-Eval-Print Loop) for interactive and single-turn modes.

use futures::StreamExt;
use puffin_core::{
    CREATE_UNIT_TEST, ConversationController, Functionality, HOW_TO_USE, PuffinConfig,
    PuffinError, RefactorOptions, Relay, Session,
};
use std::io::{self, BufRead, Read, Write};
use std::path::Path;

const HELP: &str = "\
Enter code or requirements, then a line containing only `.` to send it.

  /test              Create unit tests for the last answer
  /usage             Show how to use the last answer
  /send <text>       Ask a follow-up question
  /retry             Re-send the turn that failed
  /history           List previous responses
  /options           Show the current options
  /mode <name>       Switch to refactor, write-new-code or review
  /lang <language>   Switch language and reset options to its defaults
  /clear             Start a new conversation
  /help              Show this help
  /quit              Exit";

/// One line of REPL input, interpreted.
#[derive(Debug, PartialEq)]
enum Input<'a> {
    /// Part of the code block being typed.
    Line(&'a str),
    /// `.` on its own: send what has been typed.
    Submit,
    Command(Command<'a>),
}

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Quit,
    Help,
    CreateUnitTest,
    HowToUse,
    Send(&'a str),
    Retry,
    History,
    Options,
    Mode(&'a str),
    Language(&'a str),
    Clear,
    Unknown(&'a str),
}

/// Slash commands are only recognised when no code is being typed.
fn parse_input(line: &str, typing: bool) -> Input<'_> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    if trimmed.trim() == "." {
        return Input::Submit;
    }
    if typing || !trimmed.starts_with('/') {
        return Input::Line(trimmed);
    }
    let (cmd, arg) = match trimmed.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (trimmed, ""),
    };
    Input::Command(match cmd {
        "/quit" | "/exit" | "/q" => Command::Quit,
        "/help" | "/?" => Command::Help,
        "/test" => Command::CreateUnitTest,
        "/usage" => Command::HowToUse,
        "/send" => Command::Send(arg),
        "/retry" => Command::Retry,
        "/history" => Command::History,
        "/options" => Command::Options,
        "/mode" => Command::Mode(arg),
        "/lang" => Command::Language(arg),
        "/clear" | "/reset" => Command::Clear,
        other => Command::Unknown(other),
    })
}

/// Print fragments as they arrive. Returns the number of fragments printed.
async fn print_stream(opened: Result<Relay<'_>, PuffinError>) -> Result<usize, PuffinError> {
    let mut relay = opened?;
    let mut stdout = io::stdout();
    while let Some(fragment) = relay.next().await {
        let fragment = fragment?;
        print!("{}", fragment);
        let _ = stdout.flush();
    }
    println!();
    Ok(relay.received())
}

fn report_error(err: &PuffinError, session: &Session) {
    if let PuffinError::Conversation(puffin_core::ConversationError::TooLong { .. }) = err {
        if let Some(last) = session.messages().last() {
            println!("\x1b[31m{}\x1b[0m", last.content);
        }
    } else {
        println!("\n\x1b[31mError:\x1b[0m {}", err);
    }
    if session.can_retry() {
        println!("\x1b[90mType /retry to send it again, or /clear to start over.\x1b[0m");
    } else if err.requires_reset() {
        println!("\x1b[90mType /clear to start a new conversation.\x1b[0m");
    }
}

/// Read the input file (or stdin for `-`), send it as one turn, and stream the answer.
pub async fn run_single_turn(
    input: &Path,
    mut controller: ConversationController,
) -> anyhow::Result<()> {
    let content = if input.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", input.display(), e))?
    };

    controller.append_user_turn(&content)?;
    print_stream(controller.respond().await).await?;
    Ok(())
}

pub async fn run_interactive(
    mut controller: ConversationController,
    config: &PuffinConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    println!("\x1b[1;36m  Puffin\x1b[0m");
    println!(
        "  Model: {} | Mode: {} | Workspace: {}",
        controller.dispatcher().endpoint().name(),
        controller.functionality(),
        workspace.display()
    );
    println!("  Type /help for commands, /quit to exit\n");
    println!("\x1b[32mPuffin:\x1b[0m {}\n", controller.session().conversation().greeting());

    let stdin = io::stdin();
    let mut buffer = String::new();
    loop {
        if buffer.is_empty() {
            print!("\x1b[1;34m> \x1b[0m");
        } else {
            print!("\x1b[1;34m. \x1b[0m");
        }
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }

        match parse_input(&line, !buffer.is_empty()) {
            Input::Line(text) => {
                if !buffer.is_empty() || !text.trim().is_empty() {
                    buffer.push_str(text);
                    buffer.push('\n');
                }
            }
            Input::Submit => {
                let code = std::mem::take(&mut buffer);
                if let Err(e) = controller.append_user_turn(&code) {
                    report_error(&e, controller.session());
                    continue;
                }
                println!("\n\x1b[32mPuffin:\x1b[0m");
                if let Err(e) = print_stream(controller.respond().await).await {
                    report_error(&e, controller.session());
                }
            }
            Input::Command(command) => {
                if !handle_command(command, &mut controller, config).await {
                    println!("Goodbye!");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Run a slash command. Returns false when the REPL should exit.
async fn handle_command(
    command: Command<'_>,
    controller: &mut ConversationController,
    config: &PuffinConfig,
) -> bool {
    let result = match command {
        Command::Quit => return false,
        Command::Help => {
            println!("{}", HELP);
            Ok(0)
        }
        Command::CreateUnitTest => {
            println!("\n\x1b[32mPuffin:\x1b[0m");
            print_stream(controller.follow_up(CREATE_UNIT_TEST).await).await
        }
        Command::HowToUse => {
            println!("\n\x1b[32mPuffin:\x1b[0m");
            print_stream(controller.follow_up(HOW_TO_USE).await).await
        }
        Command::Send(text) => {
            println!("\n\x1b[32mPuffin:\x1b[0m");
            print_stream(controller.request_follow_up("Send", text).await).await
        }
        Command::Retry => {
            println!("\n\x1b[32mPuffin:\x1b[0m");
            print_stream(controller.respond().await).await
        }
        Command::History => {
            for (n, message) in controller.session().conversation().previous_responses() {
                println!("\x1b[1mResponse {}\x1b[0m ({})", n, message.timestamp.format("%H:%M:%S"));
                println!("{}\n", message.content);
            }
            Ok(0)
        }
        Command::Options => {
            show_options(controller);
            Ok(0)
        }
        Command::Mode(name) => match name.parse::<Functionality>() {
            Ok(functionality) => {
                controller.set_functionality(functionality);
                println!("Mode: {}", functionality);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        },
        Command::Language(language) => set_language(controller, config, language),
        Command::Clear => {
            controller.reset_conversation();
            println!("\x1b[32mPuffin:\x1b[0m {}", controller.session().conversation().greeting());
            Ok(0)
        }
        Command::Unknown(cmd) => {
            println!("Unknown command: {}. Type /help for commands.", cmd);
            Ok(0)
        }
    };
    if let Err(e) = result {
        report_error(&e, controller.session());
    }
    true
}

fn set_language(
    controller: &mut ConversationController,
    config: &PuffinConfig,
    language: &str,
) -> Result<usize, PuffinError> {
    if language.is_empty() {
        println!(
            "Language: {}",
            controller.options().language().unwrap_or("(none)")
        );
        return Ok(0);
    }
    let menu = config.options.load_menu()?;
    let options = RefactorOptions::defaults_for(language, controller.functionality(), &menu);
    controller.set_options_checked(options, &menu)?;
    println!("Language: {}", language);
    Ok(0)
}

fn show_options(controller: &ConversationController) {
    let params = controller.params();
    println!("Mode: {}", controller.functionality());
    println!(
        "Temperature: {} | Top P: {}",
        params.temperature, params.top_p
    );
    match serde_json::to_string_pretty(controller.options()) {
        Ok(json) => println!("{}", json),
        Err(e) => println!("Failed to render options: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_accumulate_until_dot() {
        assert_eq!(parse_input("def f(x):\n", false), Input::Line("def f(x):"));
        assert_eq!(parse_input("    return x\r\n", true), Input::Line("    return x"));
        assert_eq!(parse_input(".\n", true), Input::Submit);
        assert_eq!(parse_input(" . \n", false), Input::Submit);
    }

    #[test]
    fn test_commands_parsed() {
        assert_eq!(parse_input("/quit\n", false), Input::Command(Command::Quit));
        assert_eq!(parse_input("/test", false), Input::Command(Command::CreateUnitTest));
        assert_eq!(parse_input("/usage", false), Input::Command(Command::HowToUse));
        assert_eq!(
            parse_input("/send  what does it return?\n", false),
            Input::Command(Command::Send("what does it return?"))
        );
        assert_eq!(parse_input("/retry\n", false), Input::Command(Command::Retry));
        assert_eq!(parse_input("/lang SQL", false), Input::Command(Command::Language("SQL")));
        assert_eq!(parse_input("/nope", false), Input::Command(Command::Unknown("/nope")));
    }

    #[test]
    fn test_slash_inside_code_is_text() {
        assert_eq!(parse_input("/quit", true), Input::Line("/quit"));
        assert_eq!(parse_input("// comment", true), Input::Line("// comment"));
    }
}
