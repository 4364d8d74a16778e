use anyhow::Result;
use colored::*;

use origami::model::{Operation, OperationStatus, PackageRecord, Progress, SandboxRef};
use origami::parser::guess_category;

pub fn confirm(prompt: &str) -> Result<bool> {
    use std::io::{self, Write};

    print!("{} [y/N]: ", prompt.yellow().bold());
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let answer = input.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// Ask one of `options`, returning the choice as typed.
pub fn choose(prompt: &str, options: &[String]) -> Result<String> {
    use std::io::{self, Write};

    loop {
        print!("{} ", prompt.yellow().bold());
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            anyhow::bail!("no answer on stdin");
        }
        let answer = input.trim().to_lowercase();
        if answer.is_empty() {
            if let Some(first) = options.first() {
                return Ok(first.clone());
            }
        }
        if options.iter().any(|o| o.eq_ignore_ascii_case(&answer)) {
            return Ok(answer);
        }
        print_warning(&format!("Please answer one of: {}", options.join(", ")));
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

pub fn print_progress(progress: Progress, message: &str) {
    match progress {
        Progress::Fraction(f) => println!("{} {:>3}% {}", "…".cyan(), (f * 100.0).round() as u32, message),
        Progress::Indeterminate => println!("{} {}", "…".cyan(), message),
    }
}

pub fn print_category(category: &str) {
    println!("\n{}", category.bold().underline());
}

pub fn print_package(record: &PackageRecord) {
    let version = record
        .installed_version
        .as_deref()
        .or(record.available_version.as_deref())
        .unwrap_or("-");
    println!(
        "{} {} {} {}",
        record.reference.id.bold(),
        version.green(),
        format!("[{}]", record.reference.origin).dimmed(),
        format!("({})", guess_category(&record.reference.id)).dimmed()
    );
    if !record.description.is_empty() {
        println!("    {}", record.description);
    }
}

pub fn print_update(record: &PackageRecord) {
    println!(
        "{} {} → {}",
        record.reference.id.bold(),
        record.installed_version.as_deref().unwrap_or("-").dimmed(),
        record.available_version.as_deref().unwrap_or("-").green()
    );
}

pub fn print_sandbox(sandbox: &SandboxRef) {
    println!(
        "{} {} {}",
        sandbox.name.bold(),
        sandbox.image,
        format!("({})", sandbox.status).dimmed()
    );
}

/// Final line for a finished operation, on stdout or stderr by outcome.
pub fn print_outcome(op: &Operation) {
    let summary = op.summary.as_deref().unwrap_or_default();
    match op.status {
        OperationStatus::Succeeded => print_success(&format!("{} {}: {}", op.kind(), op.target(), summary)),
        OperationStatus::Cancelled => print_warning(&format!("{} {} cancelled: {}", op.kind(), op.target(), summary)),
        _ => {
            print_error(&format!("{} {} failed: {}", op.kind(), op.target(), summary));
            if let Some(err) = &op.error {
                for line in err.log_tail() {
                    eprintln!("    {}", line.dimmed());
                }
            }
        }
    }
}
