//! Console system.
//!
//! Provides:
//! - Console variables (cvars): a string value with a cached numeric reading
//! - A command buffer fed by config files, key bindings and `stufftext`
//! - Aliases and the `wait` command
//! - Built-in commands (`echo`, `set`, `toggle`, `alias`, `cvarlist`)
//!
//! Commands the console does not know are handed back to the caller, which
//! owns the engine state they act on (`connect`, `+forward`, `bind`, ...).
//!
//! # Usage
//! ```ignore
//! let mut console = Console::new();
//! console.register_cvar("cl_bob", "0.02", "view bob amount", CvarFlags::ARCHIVE);
//! console.add_text("cl_bob 0; connect local\n");
//! for cmd in console.execute_buffer() { /* host dispatch */ }
//! ```

use std::collections::{HashMap, VecDeque};

use anyhow::{bail, Context};
use tracing::{info, warn};

/// Console variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    /// Numeric reading of `string`; 0 when it does not parse.
    pub value: f32,
    pub default: String,
    pub description: String,
    pub flags: CvarFlags,
}

impl Cvar {
    fn set(&mut self, s: &str) {
        self.string = s.to_string();
        self.value = s.trim().parse().unwrap_or(0.0);
    }

    pub fn as_bool(&self) -> bool {
        self.value != 0.0
    }
}

bitflags::bitflags! {
    /// Cvar flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CvarFlags: u32 {
        const ARCHIVE = 1 << 0;      // Saved to config
        const SERVER = 1 << 1;       // Changes are announced to clients
        const READ_ONLY = 1 << 2;    // Only settable from code
    }
}

/// Command handler function type.
pub type CommandHandler =
    Box<dyn Fn(&[&str], &mut ConsoleContext) -> anyhow::Result<()> + Send + Sync>;

/// Context passed to command handlers.
pub struct ConsoleContext<'a> {
    /// Output buffer for command responses.
    pub output: Vec<String>,
    pub cvars: &'a mut HashMap<String, Cvar>,
    pub aliases: &'a mut HashMap<String, String>,
    /// Text to run before the rest of the buffer.
    pub insert: Vec<String>,
    pub wait: bool,
}

impl ConsoleContext<'_> {
    pub fn print(&mut self, msg: impl Into<String>) {
        self.output.push(msg.into());
    }

    pub fn set_cvar(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let Some(cvar) = self.cvars.get_mut(name) else {
            bail!("unknown cvar: {}", name);
        };
        if cvar.flags.contains(CvarFlags::READ_ONLY) {
            bail!("{} is read only", name);
        }
        cvar.set(value);
        if cvar.flags.contains(CvarFlags::SERVER) {
            info!(cvar = name, value, "server cvar changed");
        }
        Ok(())
    }
}

/// Result of running one command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Handled by the console; the lines it printed.
    Done(Vec<String>),
    /// Not a console command; tokens for the caller.
    Unhandled(Vec<String>),
}

/// The console.
pub struct Console {
    cvars: HashMap<String, Cvar>,
    commands: HashMap<String, CommandHandler>,
    aliases: HashMap<String, String>,
    buffer: VecDeque<String>,
    history: Vec<String>,
    max_history: usize,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum alias expansions per buffer run, to stop recursive aliases.
const MAX_ALIAS_EXPANSIONS: usize = 64;

impl Console {
    pub fn new() -> Self {
        let mut console = Self {
            cvars: HashMap::new(),
            commands: HashMap::new(),
            aliases: HashMap::new(),
            buffer: VecDeque::new(),
            history: Vec::new(),
            max_history: 100,
        };

        console.register_builtin_commands();
        console
    }

    fn register_builtin_commands(&mut self) {
        // echo <text>
        self.register_command("echo", |args, ctx| {
            ctx.print(args.join(" "));
            Ok(())
        });

        // cvarlist [prefix]
        self.register_command("cvarlist", |args, ctx| {
            let prefix = args.first().copied().unwrap_or("");
            let mut lines: Vec<String> = ctx
                .cvars
                .values()
                .filter(|c| c.name.starts_with(prefix))
                .map(|c| format!("  {} = \"{}\" (default: \"{}\")", c.name, c.string, c.default))
                .collect();
            lines.sort();
            for line in lines {
                ctx.print(line);
            }
            Ok(())
        });

        // set <cvar> <value>
        self.register_command("set", |args, ctx| {
            if args.len() < 2 {
                bail!("usage: set <cvar> <value>");
            }
            let value = args[1..].join(" ");
            ctx.set_cvar(args[0], &value)?;
            ctx.print(format!("{} = \"{}\"", args[0], value));
            Ok(())
        });

        // toggle <cvar>
        self.register_command("toggle", |args, ctx| {
            let Some(&name) = args.first() else {
                bail!("usage: toggle <cvar>");
            };
            let on = ctx
                .cvars
                .get(name)
                .map(Cvar::as_bool)
                .with_context(|| format!("unknown cvar: {name}"))?;
            ctx.set_cvar(name, if on { "0" } else { "1" })
        });

        // alias <name> <commands>
        self.register_command("alias", |args, ctx| {
            match args {
                [] => {
                    let mut names: Vec<String> =
                        ctx.aliases.iter().map(|(k, v)| format!("{k} : {v}")).collect();
                    names.sort();
                    ctx.output.extend(names);
                }
                [name] => {
                    let line = ctx.aliases.get(*name).map(|v| format!("{name} : {v}"));
                    ctx.print(line.unwrap_or_else(|| format!("no alias {name}")));
                }
                [name, body @ ..] => {
                    ctx.aliases.insert(name.to_string(), body.join(" "));
                }
            }
            Ok(())
        });

        // wait: defer the rest of the buffer to the next frame
        self.register_command("wait", |_args, ctx| {
            ctx.wait = true;
            Ok(())
        });
    }

    /// Registers a console variable; re-registering keeps the current value.
    pub fn register_cvar(&mut self, name: &str, default: &str, description: &str, flags: CvarFlags) {
        let mut cvar = Cvar {
            name: name.to_string(),
            string: String::new(),
            value: 0.0,
            default: default.to_string(),
            description: description.to_string(),
            flags,
        };
        cvar.set(default);
        self.cvars.entry(name.to_string()).or_insert(cvar);
    }

    /// Registers a command.
    pub fn register_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[&str], &mut ConsoleContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(name.to_string(), Box::new(handler));
    }

    /// Appends text to the command buffer.
    pub fn add_text(&mut self, text: &str) {
        self.buffer.extend(split_commands(text));
    }

    /// Puts text in front of whatever is already buffered.
    pub fn insert_text(&mut self, text: &str) {
        for cmd in split_commands(text).into_iter().rev() {
            self.buffer.push_front(cmd);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Runs buffered commands until the buffer is empty or a `wait`.
    ///
    /// Console output is logged; commands the console does not handle are
    /// returned in order.
    pub fn execute_buffer(&mut self) -> Vec<Vec<String>> {
        let mut unhandled = Vec::new();
        let mut expansions = 0;
        while let Some(line) = self.buffer.pop_front() {
            let tokens = parse_command_line(&line);
            if let Some(body) = tokens.first().and_then(|t| self.aliases.get(t)) {
                expansions += 1;
                if expansions > MAX_ALIAS_EXPANSIONS {
                    warn!(alias = %tokens[0], "alias expansion limit reached, flushing buffer");
                    self.buffer.clear();
                    break;
                }
                let body = body.clone();
                self.insert_text(&body);
                continue;
            }
            match self.run_tokens(&tokens) {
                Ok((Dispatch::Done(lines), wait)) => {
                    for l in lines {
                        info!(target: "console", "{l}");
                    }
                    if wait {
                        break;
                    }
                }
                Ok((Dispatch::Unhandled(t), _)) => unhandled.push(t),
                Err(e) => warn!(command = %line, "{e:#}"),
            }
        }
        unhandled
    }

    /// Executes one command line immediately.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Dispatch> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(Dispatch::Done(Vec::new()));
        }

        self.history.push(line.to_string());
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        let tokens = parse_command_line(line);
        if let Some(body) = tokens.first().and_then(|t| self.aliases.get(t)) {
            let body = body.clone();
            self.insert_text(&body);
            return Ok(Dispatch::Done(Vec::new()));
        }
        self.run_tokens(&tokens).map(|(d, _)| d)
    }

    fn run_tokens(&mut self, tokens: &[String]) -> anyhow::Result<(Dispatch, bool)> {
        let Some(cmd_name) = tokens.first() else {
            return Ok((Dispatch::Done(Vec::new()), false));
        };
        let args: Vec<&str> = tokens[1..].iter().map(|s| s.as_str()).collect();

        let mut ctx = ConsoleContext {
            output: Vec::new(),
            cvars: &mut self.cvars,
            aliases: &mut self.aliases,
            insert: Vec::new(),
            wait: false,
        };

        if let Some(handler) = self.commands.get(cmd_name.as_str()) {
            handler(&args, &mut ctx).with_context(|| format!("command '{}'", cmd_name))?;
        } else if let Some(cvar) = ctx.cvars.get(cmd_name.as_str()) {
            // Typing a cvar name shows it; with an argument, sets it.
            if args.is_empty() {
                let line = format!("\"{}\" is \"{}\"", cvar.name, cvar.string);
                ctx.print(line);
            } else {
                ctx.set_cvar(cmd_name, &args.join(" "))?;
            }
        } else {
            return Ok((Dispatch::Unhandled(tokens.to_vec()), false));
        }

        let ConsoleContext {
            output,
            insert,
            wait,
            ..
        } = ctx;
        for text in insert.iter().rev() {
            self.insert_text(text);
        }
        Ok((Dispatch::Done(output), wait))
    }

    pub fn cvar(&self, name: &str) -> Option<&Cvar> {
        self.cvars.get(name)
    }

    /// Numeric value of a cvar, 0 if unregistered.
    pub fn value(&self, name: &str) -> f32 {
        self.cvars.get(name).map(|c| c.value).unwrap_or(0.0)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.cvars.get(name).map(|c| c.string.as_str())
    }

    /// Sets a cvar value from code; bypasses `READ_ONLY`.
    pub fn set_cvar(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let Some(cvar) = self.cvars.get_mut(name) else {
            bail!("unknown cvar: {}", name);
        };
        cvar.set(value);
        Ok(())
    }

    /// `ARCHIVE` cvars as `name "value"` lines, sorted by name.
    pub fn archived(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .cvars
            .values()
            .filter(|c| c.flags.contains(CvarFlags::ARCHIVE))
            .map(|c| format!("{} \"{}\"", c.name, c.string))
            .collect();
        lines.sort();
        lines
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

/// Splits buffer text into single commands at newlines and at `;` outside
/// quotes.
pub fn split_commands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => out.push(std::mem::take(&mut current)),
            '\n' | '\r' => {
                in_quotes = false;
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    out.push(current);
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses a command line into tokens, respecting quotes and `//` comments.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            '/' if !in_quotes && chars.peek() == Some(&'/') => break,
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => {
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cvar_set_and_query() {
        let mut console = Console::new();
        console.register_cvar("cl_bob", "0.02", "view bob", CvarFlags::ARCHIVE);
        assert_eq!(console.value("cl_bob"), 0.02);

        console.exec("set cl_bob 0.1").unwrap();
        assert_eq!(console.value("cl_bob"), 0.1);
        console.exec("cl_bob 0").unwrap();
        assert_eq!(console.string("cl_bob"), Some("0"));
        assert_eq!(
            console.exec("cl_bob").unwrap(),
            Dispatch::Done(vec!["\"cl_bob\" is \"0\"".to_string()])
        );
        assert_eq!(console.archived(), vec!["cl_bob \"0\"".to_string()]);
    }

    #[test]
    fn read_only_cvar_rejects_console_writes() {
        let mut console = Console::new();
        console.register_cvar("version", "1.09", "", CvarFlags::READ_ONLY);
        assert!(console.exec("version 2").is_err());
        console.set_cvar("version", "2").unwrap();
        assert_eq!(console.string("version"), Some("2"));
    }

    #[test]
    fn buffer_splits_and_returns_unhandled() {
        let mut console = Console::new();
        console.register_cvar("chase_active", "0", "", CvarFlags::empty());
        console.add_text("toggle chase_active; connect local\n+forward");
        let cmds = console.execute_buffer();
        assert_eq!(console.value("chase_active"), 1.0);
        assert_eq!(
            cmds,
            vec![
                vec!["connect".to_string(), "local".to_string()],
                vec!["+forward".to_string()],
            ]
        );
    }

    #[test]
    fn wait_defers_rest_of_buffer() {
        let mut console = Console::new();
        console.add_text("cmd a; wait; cmd b");
        assert_eq!(console.execute_buffer().len(), 1);
        assert!(console.has_pending());
        assert_eq!(console.execute_buffer(), vec![vec!["cmd".to_string(), "b".to_string()]]);
    }

    #[test]
    fn aliases_expand_in_place() {
        let mut console = Console::new();
        console.add_text("alias go \"kill; say hi\"\ngo\nlast");
        let cmds = console.execute_buffer();
        let names: Vec<&str> = cmds.iter().map(|c| c[0].as_str()).collect();
        assert_eq!(names, vec!["kill", "say", "last"]);
    }

    #[test]
    fn recursive_alias_is_stopped() {
        let mut console = Console::new();
        console.add_text("alias loop loop\nloop");
        assert!(console.execute_buffer().is_empty());
        assert!(!console.has_pending());
    }

    #[test]
    fn parse_quoted_args() {
        let tokens = parse_command_line(r#"say "hello world" test // trailing"#);
        assert_eq!(tokens, vec!["say", "hello world", "test"]);
        assert_eq!(split_commands("bind x \"a; b\"; echo"), vec!["bind x \"a; b\"", "echo"]);
    }
}
