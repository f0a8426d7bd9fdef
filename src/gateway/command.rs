//! TCP 行协议解析
//!
//! 只有两种输入：带命令前缀的行交给脚本执行器，其余原样回显给发送方。

/// 一行 TCP 输入的解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpCommand<'a> {
    /// 去掉前缀后的脚本
    Exec(&'a str),
    /// 非命令行，回显给发送方
    Echo(&'a str),
}

/// 解析一行输入：先去除首尾空白，再匹配命令前缀
pub fn parse_line<'a>(line: &'a str, prefix: &str) -> TcpCommand<'a> {
    let trimmed = line.trim();
    match trimmed.strip_prefix(prefix) {
        Some(script) if !prefix.is_empty() => TcpCommand::Exec(script),
        _ => TcpCommand::Echo(trimmed),
    }
}

/// 回显给发送方的行
pub fn echo_reply(text: &str) -> String {
    format!("Echo: {}", text)
}

/// 执行成功时回给发送方的行
pub fn success_reply(output: &str) -> String {
    format!("Success: {}", output)
}

/// 执行失败时回给发送方的行
pub fn error_reply(message: &str) -> String {
    format!("Error: {}", message)
}
