//! Declarative JSON script bundles.
//!
//! A bundle maps events and chat commands to lists of actions. It is one
//! script engine among any others a host may subscribe; nothing in the core
//! depends on it.
//!
//! ```json
//! {
//!   "on_player_connected": [{ "broadcast_chat": "welcome {entity}" }],
//!   "commands": { "time": [{ "set_time": ["{0}", "{1}"] }] },
//!   "unknown_command_reply": "unknown command /{command}"
//! }
//! ```
//!
//! Placeholders: `{entity}`, `{text}`, `{command}`, `{args}` and positional
//! `{0}`..`{n}`.

use std::{collections::BTreeMap, path::Path, str::FromStr};

use anyhow::Context;
use serde::Deserialize;
use sync_shared::{ecs::EntityId, math::Vec3, weather::Season};
use thiserror::Error;
use tracing::info;

use crate::scripting::{EventName, ScriptApi, ScriptBridge, ScriptEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    #[error("command argument {{{0}}} is missing")]
    MissingArg(usize),
    #[error("'{value}' is not a valid {what}")]
    BadValue { value: String, what: &'static str },
    #[error("{0} was rejected")]
    Rejected(&'static str),
}

/// A literal or a placeholder template.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Number(f64),
    Text(String),
}

impl Arg {
    fn expand(&self, vars: &Vars<'_>) -> Result<String, BundleError> {
        match self {
            Arg::Number(n) => Ok(n.to_string()),
            Arg::Text(t) => vars.expand(t),
        }
    }

    fn parse<T: FromStr>(&self, vars: &Vars<'_>, what: &'static str) -> Result<T, BundleError> {
        let value = self.expand(vars)?;
        let trimmed = value.trim();
        trimmed.parse().map_err(|_| BundleError::BadValue {
            value: trimmed.to_string(),
            what,
        })
    }

    /// Integers may arrive as JSON numbers, which serde hands over as floats.
    fn parse_int<T: FromStr>(&self, vars: &Vars<'_>, what: &'static str) -> Result<T, BundleError> {
        match self {
            Arg::Number(n) if n.fract() == 0.0 => Arg::Text(format!("{}", *n as i64)).parse(vars, what),
            _ => self.parse(vars, what),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Chat to everyone.
    BroadcastChat(String),
    /// Chat back to the entity that triggered the event.
    SendChat(String),
    SetWeather(Arg),
    SetTime(Arg, Arg),
    SetDate(Arg, Arg),
    SetSeason(Arg),
    /// Moves the triggering entity.
    Teleport(Arg, Arg, Arg),
    /// Spawns a server-owned human with the given profile next to the
    /// triggering entity.
    SpawnHuman(Arg),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptBundle {
    pub on_player_connected: Vec<Action>,
    pub on_player_disconnected: Vec<Action>,
    pub on_chat_message: Vec<Action>,
    pub commands: BTreeMap<String, Vec<Action>>,
    pub unknown_command_reply: Option<String>,
}

struct Vars<'a> {
    entity: EntityId,
    text: &'a str,
    command: &'a str,
    args: &'a [String],
}

impl<'a> Vars<'a> {
    fn for_event(event: &'a ScriptEvent) -> Self {
        match event {
            ScriptEvent::PlayerConnected { entity } | ScriptEvent::PlayerDisconnected { entity } => Vars {
                entity: *entity,
                text: "",
                command: "",
                args: &[],
            },
            ScriptEvent::ChatMessage { entity, text } => Vars {
                entity: *entity,
                text,
                command: "",
                args: &[],
            },
            ScriptEvent::ChatCommand {
                entity,
                full_text,
                command,
                args,
            } => Vars {
                entity: *entity,
                text: full_text,
                command,
                args,
            },
        }
    }

    fn expand(&self, template: &str) -> Result<String, BundleError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return Ok(out);
            };
            let key = &after[..close];
            match key {
                "entity" => out.push_str(&self.entity.to_string()),
                "text" => out.push_str(self.text),
                "command" => out.push_str(self.command),
                "args" => out.push_str(&self.args.join(" ")),
                _ => match key.parse::<usize>() {
                    Ok(i) => out.push_str(self.args.get(i).ok_or(BundleError::MissingArg(i))?),
                    Err(_) => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                },
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn check(accepted: bool, action: &'static str) -> Result<(), BundleError> {
    if accepted {
        Ok(())
    } else {
        Err(BundleError::Rejected(action))
    }
}

impl Action {
    fn run(&self, api: &mut ScriptApi<'_>, vars: &Vars<'_>) -> anyhow::Result<()> {
        match self {
            Action::BroadcastChat(t) => check(api.broadcast_chat(&vars.expand(t)?), "broadcast_chat")?,
            Action::SendChat(t) => check(api.send_chat(vars.entity, &vars.expand(t)?), "send_chat")?,
            Action::SetWeather(name) => check(api.set_weather(&name.expand(vars)?), "set_weather")?,
            Action::SetTime(h, m) => {
                let (h, m) = (h.parse_int(vars, "hour")?, m.parse_int(vars, "minute")?);
                check(api.set_time(h, m), "set_time")?
            }
            Action::SetDate(d, mo) => {
                let (d, mo) = (d.parse_int(vars, "day")?, mo.parse_int(vars, "month")?);
                check(api.set_date(d, mo), "set_date")?
            }
            Action::SetSeason(s) => {
                let season: Season = s.parse(vars, "season")?;
                check(api.set_season(season), "set_season")?
            }
            Action::Teleport(x, y, z) => {
                let to = Vec3::new(
                    x.parse(vars, "coordinate")?,
                    y.parse(vars, "coordinate")?,
                    z.parse(vars, "coordinate")?,
                );
                api.teleport(vars.entity, to)?
            }
            Action::SpawnHuman(profile) => {
                let profile: u64 = profile.parse_int(vars, "spawn profile")?;
                let at = api
                    .transform_of(vars.entity)
                    .map_or(Vec3::ZERO, |t| t.position);
                api.spawn_human(profile, at)?;
            }
        }
        Ok(())
    }
}

fn run_all(actions: &[Action], api: &mut ScriptApi<'_>, event: &ScriptEvent) -> anyhow::Result<()> {
    let vars = Vars::for_event(event);
    for action in actions {
        action.run(api, &vars)?;
    }
    Ok(())
}

impl ScriptBundle {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read script bundle {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse script bundle {}", path.display()))
    }

    /// Subscribes the bundle's handlers. Events with no actions get none.
    pub fn install(self, bridge: &mut ScriptBridge) {
        let simple = [
            (EventName::PlayerConnected, self.on_player_connected),
            (EventName::PlayerDisconnected, self.on_player_disconnected),
            (EventName::ChatMessage, self.on_chat_message),
        ];
        for (event, actions) in simple {
            if !actions.is_empty() {
                bridge.on(event, move |api, ev| run_all(&actions, api, ev));
            }
        }

        if self.commands.is_empty() && self.unknown_command_reply.is_none() {
            return;
        }
        info!(commands = self.commands.len(), "script bundle commands installed");
        let commands = self.commands;
        let unknown = self.unknown_command_reply;
        bridge.on(EventName::ChatCommand, move |api, ev| {
            let ScriptEvent::ChatCommand { command, .. } = ev else {
                return Ok(());
            };
            match (commands.get(command.as_str()), &unknown) {
                (Some(actions), _) => run_all(actions, api, ev),
                (None, Some(reply)) => run_all(&[Action::SendChat(reply.clone())], api, ev),
                (None, None) => Ok(()),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServerContext;
    use sync_shared::{config::ServerConfig, ecs::PeerId, protocol::Message};

    const SAMPLE: &str = r#"{
        "on_player_connected": [{ "send_chat": "welcome {entity}" }],
        "commands": {
            "time": [{ "set_time": ["{0}", "{1}"] }],
            "noon": [{ "set_time": [12, 0] }],
            "season": [{ "set_season": "{0}" }],
            "tp": [{ "teleport": ["{0}", "{1}", "{2}"] }],
            "spawn": [{ "spawn_human": "{0}" }]
        },
        "unknown_command_reply": "unknown command /{command}"
    }"#;

    fn setup() -> (ServerContext, ScriptBridge, EntityId) {
        let mut ctx = ServerContext::new(ServerConfig::default());
        ctx.peers.insert(PeerId(1), 0);
        let e = ctx.spawn_player(PeerId(1));
        let mut bridge = ScriptBridge::new();
        ScriptBundle::from_json_str(SAMPLE)
            .expect("sample bundle parses")
            .install(&mut bridge);
        (ctx, bridge, e)
    }

    fn command(entity: EntityId, line: &str) -> ScriptEvent {
        let mut parts = line.trim_start_matches('/').split_whitespace();
        let command = parts.next().unwrap_or_default().to_string();
        ScriptEvent::ChatCommand {
            entity,
            full_text: line.to_string(),
            command,
            args: parts.map(str::to_string).collect(),
        }
    }

    fn chat_to(ctx: &mut ServerContext, peer: PeerId) -> Vec<String> {
        ctx.outbox
            .take()
            .into_iter()
            .filter(|(p, _)| *p == peer)
            .flat_map(|(_, frames)| frames)
            .filter_map(|f| match Message::decode(&f.frame) {
                Ok(Message::Chat(c)) => Some(c.text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn placeholders_expand() {
        let args = vec!["a".to_string(), "b".to_string()];
        let vars = Vars {
            entity: EntityId(4),
            text: "/x a b",
            command: "x",
            args: &args,
        };
        assert_eq!(vars.expand("{entity}:{command}:{1}:{args}").unwrap(), "4:x:b:a b");
        assert_eq!(vars.expand("{nope} {").unwrap(), "{nope} {");
        assert_eq!(vars.expand("{2}"), Err(BundleError::MissingArg(2)));
    }

    #[test]
    fn unknown_fields_are_refused() {
        assert!(ScriptBundle::from_json_str(r#"{ "on_tick": [] }"#).is_err());
        assert!(ScriptBundle::from_json_str(r#"{ "commands": { "x": [{ "explode": 1 }] } }"#).is_err());
    }

    #[test]
    fn connect_greeting_and_commands() {
        let (mut ctx, mut bridge, e) = setup();
        bridge.fire(&mut ctx, ScriptEvent::PlayerConnected { entity: e });
        assert_eq!(chat_to(&mut ctx, PeerId(1)), vec![format!("welcome {e}")]);

        bridge.fire(&mut ctx, command(e, "/time 14 30"));
        assert_eq!((ctx.world.weather.time_hour, ctx.world.weather.time_minute), (14, 30));

        bridge.fire(&mut ctx, command(e, "/noon"));
        assert_eq!(ctx.world.weather.time_hour, 12);

        bridge.fire(&mut ctx, command(e, "/season winter"));
        assert_eq!(ctx.world.weather.season, Season::Winter);

        ctx.outbox.take();
        bridge.fire(&mut ctx, command(e, "/dance"));
        assert_eq!(chat_to(&mut ctx, PeerId(1)), vec!["unknown command /dance".to_string()]);
    }

    #[test]
    fn bad_arguments_fail_the_handler() {
        let (mut ctx, mut bridge, e) = setup();
        bridge.fire(&mut ctx, command(e, "/time 25 0"));
        assert_eq!(ctx.world.weather.time_hour, 12, "rejected change leaves state");
        bridge.fire(&mut ctx, command(e, "/time 10 0"));
        assert_eq!(ctx.world.weather.time_hour, 12, "quarantined until the tick ends");

        bridge.begin_tick();
        bridge.fire(&mut ctx, command(e, "/time 10 0"));
        assert_eq!(ctx.world.weather.time_hour, 10);
    }

    #[test]
    fn spawn_and_teleport_queue_mutations() {
        let (mut ctx, mut bridge, e) = setup();
        bridge.fire(&mut ctx, command(e, "/spawn 3"));
        bridge.fire(&mut ctx, command(e, "/tp 1 2 3"));
        assert_eq!(ctx.mutations.len(), 2);
    }
}
