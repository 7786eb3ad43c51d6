pub mod chat;
pub mod git;
pub mod issue_tracker;
pub mod mail;
pub mod wiki;
