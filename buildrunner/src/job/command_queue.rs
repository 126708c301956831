//! The ordered list of shell commands a job runs.
//!
//! Every command is stored together with the redirection of its output into the job's log file.
//! The redirection is decided once, when the command is appended: the first command of a batch
//! truncates the log and every command after it appends to it.
use std::{
    collections::VecDeque,
    fmt::Display,
    path::{Path, PathBuf},
};

/// How a command's output is written to the job log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Redirect {
    /// Start the log afresh.
    Truncate,
    /// Add to the end of the existing log.
    Append,
}

impl Redirect {
    fn operator(self) -> &'static str {
        match self {
            Self::Truncate => ">",
            Self::Append => ">>",
        }
    }

    /// The shell redirection clause sending stdout and stderr to `log_file`.
    pub fn suffix(self, log_file: &Path) -> String {
        format!(" {} {} 2>&1", self.operator(), log_file.display())
    }
}

/// A FIFO of fully formed shell commands belonging to one job.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    log_file: PathBuf,
    commands: VecDeque<String>,
}

impl CommandQueue {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            commands: VecDeque::new(),
        }
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// The redirection the next appended command will get.
    pub fn next_redirect(&self) -> Redirect {
        if self.commands.is_empty() {
            Redirect::Truncate
        } else {
            Redirect::Append
        }
    }

    /// Appends `command` with its redirection clause and returns the stored string.
    pub fn append(&mut self, command: impl Display) -> &str {
        let command = format!("{command}{}", self.next_redirect().suffix(&self.log_file));
        self.commands.push_back(command);
        self.commands.back().map(String::as_str).unwrap_or_default()
    }

    /// Builds `command` redirected in append mode regardless of what is queued.
    ///
    /// This is used for lines written after the queue has been drained, which must never
    /// truncate the output already in the log.
    pub fn appending(&self, command: impl Display) -> String {
        format!("{command}{}", Redirect::Append.suffix(&self.log_file))
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.commands.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Drops every queued command, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.commands.len();
        self.commands.clear();
        discarded
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "/logs/1.txt";

    #[test]
    fn first_command_truncates() {
        let mut queue = CommandQueue::new(LOG);

        assert_eq!(queue.next_redirect(), Redirect::Truncate);
        assert_eq!(
            queue.append("mkdir -p /tmp/w/out"),
            "mkdir -p /tmp/w/out > /logs/1.txt 2>&1"
        );
    }

    #[test]
    fn later_commands_append() {
        let mut queue = CommandQueue::new(LOG);
        queue.append("make clean");
        queue.append("repo sync");
        queue.append("make -j3");

        let commands = queue.iter().collect::<Vec<_>>();
        assert_eq!(
            commands,
            vec![
                "make clean > /logs/1.txt 2>&1",
                "repo sync >> /logs/1.txt 2>&1",
                "make -j3 >> /logs/1.txt 2>&1",
            ]
        );
    }

    #[test]
    fn draining_starts_a_new_batch() {
        let mut queue = CommandQueue::new(LOG);
        queue.append("first");
        queue.append("second");
        while queue.pop_front().is_some() {}

        assert_eq!(queue.append("third"), "third > /logs/1.txt 2>&1");
    }

    #[test]
    fn clearing_starts_a_new_batch() {
        let mut queue = CommandQueue::new(LOG);
        queue.append("first");
        queue.append("second");

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.append("third"), "third > /logs/1.txt 2>&1");
    }

    #[test]
    fn appending_never_truncates() {
        let queue = CommandQueue::new(LOG);

        assert!(queue.is_empty());
        assert_eq!(
            queue.appending("echo 'done'"),
            "echo 'done' >> /logs/1.txt 2>&1"
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn pops_in_append_order() {
        let mut queue = CommandQueue::new(LOG);
        queue.append("a");
        queue.append("b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().as_deref(), Some("a > /logs/1.txt 2>&1"));
        assert_eq!(queue.pop_front().as_deref(), Some("b >> /logs/1.txt 2>&1"));
        assert_eq!(queue.pop_front(), None);
    }
}
