#[cfg(test)]
#[path = "slash_commands_test.rs"]
mod tests;

use super::Action;
use super::ModelRef;

pub struct SlashCommand {
    command: String,
    pub args: Vec<String>,
}

impl SlashCommand {
    pub fn parse(text: &str) -> Option<SlashCommand> {
        let mut args = text
            .trim()
            .split(' ')
            .filter(|e| return !e.is_empty())
            .map(|e| return e.to_string())
            .collect::<Vec<String>>();
        if args.is_empty() {
            return None;
        }
        let prefix = args[0].to_string();
        args.remove(0);

        let cmd = SlashCommand {
            command: prefix,
            args,
        };
        if cmd.is_quit()
            || cmd.is_help()
            || cmd.is_new()
            || cmd.is_sessions()
            || cmd.is_switch()
            || cmd.is_delete()
            || cmd.is_fork()
            || cmd.is_undo()
            || cmd.is_redo()
            || cmd.is_agent()
            || cmd.is_model()
            || cmd.is_model_list()
            || cmd.is_attach()
            || cmd.is_status()
        {
            return Some(cmd);
        }

        return None;
    }

    fn first_arg(&self) -> Option<String> {
        return self.args.first().map(|e| return e.to_string());
    }

    /// Maps the command to the intent it stands for. Quit and help are
    /// handled by the presentation itself and map to nothing, as do commands
    /// missing a required argument.
    pub fn to_action(&self) -> Option<Action> {
        if self.is_new() {
            return Some(Action::NewSession());
        }
        if self.is_sessions() {
            return Some(Action::ListSessions());
        }
        if self.is_switch() {
            return self.first_arg().map(Action::SwitchSession);
        }
        if self.is_delete() {
            return Some(Action::DeleteSession(self.first_arg()));
        }
        if self.is_fork() {
            return Some(Action::ForkSession(self.first_arg()));
        }
        if self.is_undo() {
            return Some(Action::Revert(self.first_arg()));
        }
        if self.is_redo() {
            return Some(Action::Unrevert());
        }
        if self.is_agent() {
            return self.first_arg().map(Action::ChangeAgent);
        }
        if self.is_model() {
            return self
                .first_arg()
                .and_then(|e| return ModelRef::parse(&e))
                .map(Action::ChangeModel);
        }
        if self.is_model_list() {
            return Some(Action::ListModels());
        }
        if self.is_attach() {
            if self.args.is_empty() {
                return None;
            }
            return Some(Action::AttachFile(self.args.join(" ")));
        }
        if self.is_status() {
            return Some(Action::ServerStatus());
        }

        return None;
    }

    pub fn is_quit(&self) -> bool {
        return ["/q", "/quit", "/exit"].contains(&self.command.as_str());
    }

    pub fn is_help(&self) -> bool {
        return ["/h", "/help"].contains(&self.command.as_str());
    }

    pub fn is_new(&self) -> bool {
        return ["/n", "/new"].contains(&self.command.as_str());
    }

    pub fn is_sessions(&self) -> bool {
        return ["/s", "/sessions"].contains(&self.command.as_str());
    }

    pub fn is_switch(&self) -> bool {
        return ["/sw", "/switch"].contains(&self.command.as_str());
    }

    pub fn is_delete(&self) -> bool {
        return ["/d", "/delete"].contains(&self.command.as_str());
    }

    pub fn is_fork(&self) -> bool {
        return ["/f", "/fork"].contains(&self.command.as_str());
    }

    pub fn is_undo(&self) -> bool {
        return ["/u", "/undo", "/revert"].contains(&self.command.as_str());
    }

    pub fn is_redo(&self) -> bool {
        return ["/r", "/redo", "/unrevert"].contains(&self.command.as_str());
    }

    pub fn is_agent(&self) -> bool {
        return ["/ag", "/agent"].contains(&self.command.as_str());
    }

    pub fn is_model(&self) -> bool {
        return ["/m", "/model"].contains(&self.command.as_str());
    }

    pub fn is_model_list(&self) -> bool {
        return ["/ml", "/models", "/modellist"].contains(&self.command.as_str());
    }

    pub fn is_attach(&self) -> bool {
        return ["/at", "/attach"].contains(&self.command.as_str());
    }

    pub fn is_status(&self) -> bool {
        return ["/st", "/status"].contains(&self.command.as_str());
    }
}
