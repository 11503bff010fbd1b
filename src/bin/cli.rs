#![cfg(not(tarpaulin_include))]

use screener::{
    Config, ScreenerError, SearchStatus, Session, Tabular, source_from_config,
};
use std::io::{self, Write};
use std::time::Instant;

/// Rows printed per screen; the rest are summarized.
const DISPLAY_ROWS: usize = 20;

fn prompt(label: &str) -> Option<String> {
    print!("{}", label);
    io::stdout().flush().ok()?;

    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

fn print_view<T: Tabular + ?Sized>(view: &T) {
    let columns = view.columns();
    let rows: Vec<Vec<String>> = view
        .row_iter()
        .map(|row| row.iter().map(|c| c.canonical_text()).collect())
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in rows.iter().take(DISPLAY_ROWS) {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    println!("{}", format_line(columns.iter().map(String::as_str), &widths));
    println!(
        "{}",
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-")
    );
    for row in rows.iter().take(DISPLAY_ROWS) {
        println!("{}", format_line(row.iter().map(String::as_str), &widths));
    }
    if rows.len() > DISPLAY_ROWS {
        println!("... {} more rows", rows.len() - DISPLAY_ROWS);
    }
}

fn format_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(c, w)| format!("{:<width$}", c, width = *w))
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Help,
    Clear,
    Search(&'a str),
    Reload,
    Export(&'a str),
    Logout,
    Invalid,
}

/// Parse one prompt line; arguments come back trimmed.
fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    let (word, arg) = match line.split_once(char::is_whitespace) {
        Some((word, arg)) => (word, arg.trim()),
        None => (line, ""),
    };

    match (word, arg) {
        ("q" | "quit", "") => Command::Quit,
        ("help", "") => Command::Help,
        ("clear", "") => Command::Clear,
        ("reload", "") => Command::Reload,
        ("logout", "") => Command::Logout,
        ("search", text) => Command::Search(text),
        ("export", path) => Command::Export(path),
        _ => Command::Invalid,
    }
}

fn print_help() {
    println!("Commands:");
    println!("  search <text>: Show rows containing <text> in any column");
    println!("  clear: Show the whole sheet");
    println!("  reload: Fetch the sheet again");
    println!("  export <path>: Write the current view as CSV to <path>");
    println!("  logout: Sign out");
    println!("  q: Quit");
}

fn describe(e: &ScreenerError) -> String {
    match e {
        ScreenerError::SourceUnavailable { .. } => format!(
            "Error connecting to Google Sheet: {}. Check that the sheet is shared with the service account, then reload.",
            e
        ),
        _ => e.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = Config::load()?;
    // A missing [auth] section is reported at the first login attempt.
    let store = config.credential_store().map_err(|e| e.to_string());
    let source = source_from_config(&config)?;
    let sheet_name = config.sheet.name.clone();

    let mut session = Session::new();
    let mut query = String::new();
    let mut status = String::from("ok");
    let mut show = true;
    let mut auto_load = true;
    let mut start_time = Instant::now();

    loop {
        if !session.is_authenticated() {
            println!("Swing Screener - sign in");
            let Some(email) = prompt("Email: ") else { break };
            let Some(password) = prompt("Password: ") else { break };

            let store = match &store {
                Ok(store) => store,
                Err(message) => {
                    eprintln!("{}", message);
                    return Err(message.clone().into());
                }
            };
            println!("{}", session.attempt_login(store, &email, &password).message());
            show = true;
            auto_load = true;
            continue;
        }

        if auto_load && !session.has_table() {
            auto_load = false;
            println!("Connecting to Google Sheet...");
            match session.load_table(source.as_ref(), &sheet_name).await {
                Ok(table) => println!(
                    "Connected to Google Sheet successfully! ({} rows, {} columns)",
                    table.row_count(),
                    table.column_count()
                ),
                Err(e) => {
                    println!("{}", describe(&e));
                    status = String::from("error");
                    show = false;
                }
            }
        }

        if show {
            if let Ok(view) = session.search(&query) {
                match view.status() {
                    SearchStatus::Matches(n) => println!("Found {} matching rows", n),
                    SearchStatus::NoMatches => println!("No matching results found."),
                    SearchStatus::Unfiltered => {}
                }
                print_view(&view);
            }
        }

        let elapsed = start_time.elapsed().as_secs_f64();
        let Some(command) = prompt(&format!("[{:.1}] ({}) > ", elapsed, status)) else {
            break;
        };
        let command = command.trim();
        start_time = Instant::now();
        show = true;

        match parse_command(command) {
            Command::Quit => break,
            Command::Help => {
                print_help();
                show = false;
            }
            Command::Clear => {
                query.clear();
                status = String::from("ok");
            }
            Command::Search(text) => {
                query = text.to_string();
                status = String::from("ok");
            }
            Command::Reload => match session.refresh(source.as_ref(), &sheet_name).await {
                Ok(_) => status = String::from("ok"),
                Err(e) => {
                    println!("{}", describe(&e));
                    status = String::from("error");
                }
            },
            Command::Export("") => {
                status = String::from("missing path");
                show = false;
            }
            Command::Export(path) => {
                match session.export(&query) {
                    Ok(download) => match std::fs::write(path, &download.bytes) {
                        Ok(()) => {
                            println!("Wrote {} ({} bytes)", path, download.bytes.len());
                            status = String::from("ok");
                        }
                        Err(e) => {
                            println!("Could not write {}: {}", path, e);
                            status = String::from("error");
                        }
                    },
                    Err(e) => {
                        println!("{}", describe(&e));
                        status = String::from("error");
                    }
                }
                show = false;
            }
            Command::Logout => {
                session.logout();
                query.clear();
                status = String::from("ok");
            }
            Command::Invalid => {
                status = String::from("invalid command");
                show = false;
            }
        }
    }

    Ok(())
}
