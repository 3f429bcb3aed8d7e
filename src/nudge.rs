//! Nudge and prompt rendering.
//!
//! Everything the orchestrator says to an agent is rendered from one of
//! these templates, then delivered through the reliable paste protocol.

use minijinja::{context, Environment};

use crate::identity::Identity;

const STARTUP_TEMPLATE: &str = include_str!("templates/startup.jinja");
const PROPULSION_TEMPLATE: &str = include_str!("templates/propulsion.jinja");
const CHARGE_TEMPLATE: &str = include_str!("templates/charge.jinja");
const HEALTH_CHECK_TEMPLATE: &str = include_str!("templates/health_check.jinja");

fn env() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_template("startup", STARTUP_TEMPLATE)
        .expect("startup template");
    env.add_template("propulsion", PROPULSION_TEMPLATE)
        .expect("propulsion template");
    env.add_template("charge", CHARGE_TEMPLATE)
        .expect("charge template");
    env.add_template("health_check", HEALTH_CHECK_TEMPLATE)
        .expect("health_check template");
    env
}

/// First nudge after a session starts: identity, handoff discovery.
pub fn startup(
    bin: &str,
    identity: &Identity,
    encampment: &str,
    home: &str,
    predecessor: Option<&str>,
) -> anyhow::Result<String> {
    let rendered = env().get_template("startup")?.render(context! {
        bin,
        address => identity.address(),
        encampment,
        home,
        predecessor,
    })?;
    Ok(rendered.trim().to_string())
}

/// Second nudge: the role-specific instruction to begin autonomous work.
pub fn propulsion(bin: &str, identity: &Identity) -> anyhow::Result<String> {
    let rendered = env().get_template("propulsion")?.render(context! {
        bin,
        role => identity.role().as_str(),
        warband => identity.warband().unwrap_or_default(),
    })?;
    Ok(rendered.trim().to_string())
}

/// Work-start signal sent when a bead lands on an agent's hook.
pub fn charge(
    bin: &str,
    bead_id: &str,
    subject: Option<&str>,
    message: Option<&str>,
    args: Option<&str>,
    dispatcher: &str,
) -> anyhow::Result<String> {
    let rendered = env().get_template("charge")?.render(context! {
        bin,
        bead_id,
        subject,
        message,
        args,
        dispatcher,
    })?;
    Ok(rendered.trim().to_string())
}

/// Shaman's liveness ping.
pub fn health_check(bin: &str, session: &str) -> anyhow::Result<String> {
    let rendered = env()
        .get_template("health_check")?
        .render(context! { bin, session })?;
    Ok(rendered.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_mentions_predecessor_only_when_present() {
        let id = Identity::raider("horde", "Toast").unwrap();
        let with = startup("hd", &id, "wastes", "/camp", Some("hd-horde-Toast")).unwrap();
        assert!(with.contains("horde/raiders/Toast"));
        assert!(with.contains("hd-horde-Toast"));

        let without = startup("hd", &id, "wastes", "/camp", None).unwrap();
        assert!(!without.contains("previous session"));
    }

    #[test]
    fn propulsion_varies_by_role() {
        let warchief = propulsion("hd", &Identity::warchief()).unwrap();
        assert!(warchief.contains("callbacks process"));

        let raider =
            propulsion("hd", &Identity::raider("horde", "Toast").unwrap()).unwrap();
        assert!(raider.contains("hd hook"));

        let forge = propulsion("hd", &Identity::forge("horde").unwrap()).unwrap();
        assert!(forge.contains("merge queue"));
    }

    #[test]
    fn charge_prompt_carries_bead_and_args() {
        let text = charge(
            "hd",
            "gp-123",
            Some("fix the codec"),
            None,
            Some("--fast"),
            "warchief",
        )
        .unwrap();
        assert!(text.contains("gp-123"));
        assert!(text.contains("fix the codec"));
        assert!(text.contains("--fast"));
        assert!(text.contains("warchief"));
    }

    #[test]
    fn health_check_names_session() {
        let text = health_check("hd", "hd-horde-Toast").unwrap();
        assert!(text.contains("HEALTH_OK hd-horde-Toast"));
    }
}
