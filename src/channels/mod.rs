//! Mail I/O: IMAP for reading bounces, SMTP for resending.

pub mod imap;
pub mod smtp;

pub use imap::{ImapConnector, MailboxConnector, MailboxSession};
pub use smtp::{MailTransport, SmtpMailer};
