use clap::Subcommand;

use crate::context::Ctx;
use crate::mailbox::{deliver, Draft, MessageType, Priority, SearchOpts};

#[derive(Debug, Subcommand)]
pub enum MailCommand {
    /// Send a message; channels fan out, queues fan in
    Send {
        /// Recipient address, queue, or channel
        to: String,
        #[arg(long)]
        subject: String,
        /// Body text
        #[arg(short, long, default_value = "")]
        message: String,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long)]
        cc: Vec<String>,
        /// Message id this replies to
        #[arg(long)]
        reply_to: Option<String>,
        /// Mark ephemeral
        #[arg(long)]
        wisp: bool,
    },
    /// Show the caller's inbox
    Inbox {
        /// Include already-read messages
        #[arg(long)]
        all: bool,
    },
    /// Print one message and mark it read
    Read { id: String },
    /// Remove a message
    Archive { id: String },
    /// Search the caller's mailbox
    Search {
        query: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        subject_only: bool,
        #[arg(long)]
        body_only: bool,
    },
}

impl MailCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        match self {
            MailCommand::Send {
                to,
                subject,
                message,
                priority,
                cc,
                reply_to,
                wisp,
            } => {
                let draft = Draft {
                    from: ctx.actor(),
                    to: to.clone(),
                    cc: cc.clone(),
                    subject: subject.clone(),
                    body: message.clone(),
                    msg_type: if reply_to.is_some() {
                        MessageType::Reply
                    } else {
                        MessageType::Notification
                    },
                    priority: priority.parse::<Priority>()?,
                    thread_id: None,
                    reply_to: reply_to.clone(),
                    pinned: false,
                    wisp: *wisp,
                };
                let stored = deliver(ctx.root(), &ctx.encampment, &ctx.registry, &draft)?;
                for message in &stored {
                    ctx.feed.emit(
                        "mail",
                        &ctx.actor(),
                        serde_json::json!({"to": message.to, "subject": message.subject}),
                    );
                }
                eprintln!("✓ delivered to {} mailbox(es)", stored.len());
                Ok(())
            }
            MailCommand::Inbox { all } => {
                let mailbox = ctx.mailbox(&ctx.actor());
                let messages = if *all {
                    mailbox.list_all()?
                } else {
                    mailbox.list_unread()?
                };
                if messages.is_empty() {
                    println!("inbox empty");
                }
                for m in messages {
                    let flags = format!(
                        "{}{}",
                        if m.read { " " } else { "*" },
                        if m.priority >= Priority::High { "!" } else { " " }
                    );
                    println!("{flags} {}  {}  {}  {}", m.id, m.timestamp, m.from, m.subject);
                }
                Ok(())
            }
            MailCommand::Read { id } => {
                let mailbox = ctx.mailbox(&ctx.actor());
                let message = mailbox.get(id)?;
                println!("From:     {}", message.from);
                println!("Subject:  {}", message.subject);
                println!("Priority: {}", message.priority);
                println!("Thread:   {}", message.thread_id);
                println!();
                println!("{}", message.body);
                mailbox.mark_read(id)?;
                Ok(())
            }
            MailCommand::Archive { id } => {
                let mailbox = ctx.mailbox(&ctx.actor());
                if mailbox.delete(id)? {
                    eprintln!("✓ archived {id}");
                } else {
                    eprintln!("{id} already gone");
                }
                Ok(())
            }
            MailCommand::Search {
                query,
                from,
                subject_only,
                body_only,
            } => {
                let mailbox = ctx.mailbox(&ctx.actor());
                let hits = mailbox.search(&SearchOpts {
                    query: query.clone(),
                    from_filter: from.clone(),
                    subject_only: *subject_only,
                    body_only: *body_only,
                })?;
                for m in &hits {
                    println!("{}  {}  {}", m.id, m.from, m.subject);
                }
                println!("{} match(es)", hits.len());
                Ok(())
            }
        }
    }
}
