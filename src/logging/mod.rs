//! Pull progress output
//!
//! The [`Logger`] renders a pull as a sequence of phases (probe, manifest,
//! layers, load) with indented context lines underneath. Verbose mode adds
//! wire-level detail such as URLs, digests, and media types; quiet mode
//! drops everything on stdout so stream mode can own the descriptor.
//! Warnings and errors always go to stderr.

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
        }
    }

    /// Begin a named phase of the pull
    pub fn phase(&self, name: &str) {
        if !self.quiet {
            println!("==> {}", name);
        }
    }

    /// One unit of progress inside the current phase
    pub fn step(&self, message: &str) {
        if !self.quiet {
            println!(" -> {}", message);
        }
    }

    /// Wire-level context under the current step; verbose mode only
    pub fn detail(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("    {}", message);
        }
    }

    /// Terminal line for a completed pull or load
    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!(" ok {}", message);
        }
    }

    /// Recoverable oddities: expired tokens, flags with no effect
    pub fn warning(&self, message: &str) {
        eprintln!("warning: {}", message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("error: {}", message);
    }

    /// Render a byte count in the largest unit that keeps it readable
    pub fn format_size(&self, bytes: u64) -> String {
        const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} B", bytes)
        } else {
            format!("{:.1} {}", value, UNITS[unit])
        }
    }
}
