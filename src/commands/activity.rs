use clap::Subcommand;

use crate::context::Ctx;

#[derive(Debug, Subcommand)]
pub enum ActivityCommand {
    /// Append one event to the telemetry feed
    Emit {
        /// Event type (charge, hook, nudge, mail, spawn, patrol, merge, ...)
        event_type: String,
        /// Payload fields (k=v), repeatable
        #[arg(long = "field", value_name = "K=V")]
        fields: Vec<String>,
        /// Override the actor (defaults to the caller's address)
        #[arg(long)]
        actor: Option<String>,
    },
}

impl ActivityCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ActivityCommand::Emit {
            event_type,
            fields,
            actor,
        } = self;
        let ctx = Ctx::from_process(None)?;

        let mut payload = serde_json::Map::new();
        for pair in fields {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("--field expects K=V, got {pair:?}"))?;
            payload.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }

        let actor = actor.clone().unwrap_or_else(|| ctx.actor());
        ctx.feed
            .emit(event_type, &actor, serde_json::Value::Object(payload));
        Ok(())
    }
}
