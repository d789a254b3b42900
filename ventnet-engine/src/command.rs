use std::collections::HashMap;

use ventnet_core::EntityId;

use crate::service::ActionService;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    /// 按空白切分一行文本命令，首段为命令名。
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?.to_string();
        Some(Self {
            name,
            args: parts.map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse;
}

pub struct CommandContext<'a> {
    pub service: &'a mut ActionService,
}

pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        let mut bus = Self {
            handlers: HashMap::new(),
        };
        bus.register(UndoCommand);
        bus.register(RedoCommand);
        bus.register(SelectCommand);
        bus.register(RemoveCommand);
        bus.register(SaveCommand);
        bus.register(HistoryCommand);
        bus
    }

    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.name(), Box::new(handler));
    }

    pub fn dispatch(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if let Some(handler) = self.handlers.get(request.name.as_str()) {
            handler.execute(request, context)
        } else {
            CommandResponse::err(format!("未知命令: {}", request.name))
        }
    }

    pub fn available_commands(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }
}

fn parse_id(raw: &str) -> Result<EntityId, CommandResponse> {
    raw.parse::<u64>()
        .map(EntityId::new)
        .map_err(|_| CommandResponse::err(format!("无效的实体 id: {raw}")))
}

struct UndoCommand;

impl CommandHandler for UndoCommand {
    fn name(&self) -> &'static str {
        "undo"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        match context.service.handle_undo() {
            Ok(true) => CommandResponse::ok("已撤销"),
            Ok(false) => CommandResponse::ok("没有可撤销的操作"),
            Err(err) => CommandResponse::err(format!("撤销失败: {err}")),
        }
    }
}

struct RedoCommand;

impl CommandHandler for RedoCommand {
    fn name(&self) -> &'static str {
        "redo"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        match context.service.handle_redo() {
            Ok(true) => CommandResponse::ok("已重做"),
            Ok(false) => CommandResponse::ok("没有可重做的操作"),
            Err(err) => CommandResponse::err(format!("重做失败: {err}")),
        }
    }
}

/// `select <id>` 选中实体，`select` 或 `select none` 清空选择。
struct SelectCommand;

impl CommandHandler for SelectCommand {
    fn name(&self) -> &'static str {
        "select"
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let target = match request.args.first().map(String::as_str) {
            None | Some("none") => None,
            Some(raw) => match parse_id(raw) {
                Ok(id) => Some(id),
                Err(response) => return response,
            },
        };
        match context.service.select(target) {
            Ok(()) => match target {
                Some(id) => CommandResponse::ok(format!("已选中实体 {id}")),
                None => CommandResponse::ok("选中集已清空"),
            },
            Err(err) => CommandResponse::err(err.to_string()),
        }
    }
}

/// `remove <id>...` 删除一个或多个实体（级联）。
struct RemoveCommand;

impl CommandHandler for RemoveCommand {
    fn name(&self) -> &'static str {
        "remove"
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if request.args.is_empty() {
            return CommandResponse::err("用法: remove <id>...");
        }
        let mut ids = Vec::with_capacity(request.args.len());
        for raw in &request.args {
            match parse_id(raw) {
                Ok(id) => ids.push(id),
                Err(response) => return response,
            }
        }
        let result = if ids.len() == 1 {
            context.service.remove(ids[0])
        } else {
            context.service.remove_batch(ids)
        };
        match result {
            Ok(removed) => CommandResponse::ok(format!("已删除 {} 个实体", removed.len())),
            Err(err) => CommandResponse::err(err.to_string()),
        }
    }
}

/// `save [name]` 保存当前场景。
struct SaveCommand;

impl CommandHandler for SaveCommand {
    fn name(&self) -> &'static str {
        "save"
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let name = (!request.args.is_empty()).then(|| request.args.join(" "));
        match context.service.save(name.as_deref()) {
            Ok(id) => CommandResponse::ok(format!("场景已保存: {id}")),
            Err(err) => CommandResponse::err(format!("保存失败: {err}")),
        }
    }
}

struct HistoryCommand;

impl CommandHandler for HistoryCommand {
    fn name(&self) -> &'static str {
        "history"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let history = context.service.history();
        let stats = history.stats();
        let mut lines = vec![format!(
            "共 {} 条记录，当前位置 {}",
            stats.total, stats.current
        )];
        for (index, action) in history.actions().enumerate() {
            let marker = if index < stats.current { "*" } else { " " };
            lines.push(format!("{marker} {}", action.label()));
        }
        CommandResponse::ok(lines.join("\n"))
    }
}
