//! qq-phone-core
//!
//! 酒馆手机插件核心：聊天记录实体提取 + 消息列表渲染调度
//!
//! 标记格式 (均写在 AI 回复正文中):
//!
//! ```text
//! [好友id|名称|号码]                         添加好友
//! [群聊|群名|群号|成员、成员]                  添加群聊
//! [群聊消息|群号|发送者|类型|内容]              群聊消息 (对方)
//! [我方群聊消息|我|群号|类型|内容]              群聊消息 (我方)
//! [我方消息|我|好友号|内容|时间]                私聊消息 (我方)
//! [对方消息|名称|好友号|类型|内容]              私聊消息 (对方)
//! [表情包|..|内容] [语音|名称|内容] [红包|内容|..]
//! ```
//!
//! `<think>` / `<thinking>` 块内的标记不参与提取，删除操作也不会改动它们。
//! `|` 与 `]` 不做转义，名称或内容中出现这两个字符会导致截断。

// --- 类型定义 ---
pub mod types {
    use serde::{Deserialize, Serialize};

    /// 毫秒时间戳 (与酒馆 `send_date` 一致)
    pub type Millis = i64;

    /// 宿主聊天记录中的一条消息，只读。
    ///
    /// 宿主的消息对象不带编号，消息下标一律取它在聊天记录中的位置。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ChatMessage {
        #[serde(rename = "mes")]
        pub text: String,
        #[serde(default, rename = "send_date")]
        pub timestamp: Option<Millis>,
    }

    impl ChatMessage {
        pub fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                timestamp: None,
            }
        }

        pub fn with_timestamp(mut self, ts: Millis) -> Self {
            self.timestamp = Some(ts);
            self
        }

        pub fn sequence<S: AsRef<str>>(texts: &[S]) -> Vec<Self> {
            texts.iter().map(|t| Self::new(t.as_ref())).collect()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ContactKind {
        Friend,
        Group,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Contact {
        pub kind: ContactKind,
        /// 好友: `friend_{名称}_{号码}`，群聊: `group_{群号}`
        pub id: String,
        /// 好友号 / 群号，列表 DOM 上的 `data-friend-id`
        pub number: String,
        pub display_name: String,
        /// 仅群聊：`、` 分隔的原始成员串，只增不减
        pub members: Option<String>,
        pub last_seen_message_index: usize,
        /// 首次出现 (或被覆盖) 时消息的时间，缺失表示“当前”
        pub add_time: Option<Millis>,
        pub last_message_time: Option<Millis>,
        pub last_message_preview: String,
        pub has_unread: bool,
        /// 列表分组：special / colleague / client，其余归入顶部列表
        #[serde(default)]
        pub group_type: Option<String>,
    }

    impl Contact {
        pub fn friend(name: &str, number: &str, index: usize, add_time: Option<Millis>) -> Self {
            Self {
                kind: ContactKind::Friend,
                id: format!("friend_{}_{}", name, number),
                number: number.to_string(),
                display_name: name.to_string(),
                members: None,
                last_seen_message_index: index,
                add_time,
                last_message_time: None,
                last_message_preview: String::new(),
                has_unread: false,
                group_type: None,
            }
        }

        pub fn group(
            name: &str,
            group_id: &str,
            members: &str,
            index: usize,
            add_time: Option<Millis>,
        ) -> Self {
            Self {
                kind: ContactKind::Group,
                id: format!("group_{}", group_id),
                number: group_id.to_string(),
                display_name: name.to_string(),
                members: Some(members.to_string()),
                last_seen_message_index: index,
                add_time,
                last_message_time: None,
                last_message_preview: String::new(),
                has_unread: false,
                group_type: None,
            }
        }

        pub fn is_group(&self) -> bool {
            self.kind == ContactKind::Group
        }

        pub fn member_names(&self) -> Vec<&str> {
            self.members
                .as_deref()
                .map(|m| {
                    m.split('、')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        }

        /// 排序键：缺失的时间视为最新
        pub(crate) fn sort_key(&self) -> Millis {
            self.add_time.unwrap_or(Millis::MAX)
        }
    }

    /// 一次完整提取的结果，按 `add_time` 倒序
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct ExtractionResult {
        pub contacts: Vec<Contact>,
    }

    impl ExtractionResult {
        pub fn len(&self) -> usize {
            self.contacts.len()
        }

        pub fn is_empty(&self) -> bool {
            self.contacts.is_empty()
        }

        pub fn iter(&self) -> std::slice::Iter<'_, Contact> {
            self.contacts.iter()
        }

        /// 按好友号/群号查找
        pub fn get_by_number(&self, number: &str) -> Option<&Contact> {
            self.contacts.iter().find(|c| c.number == number)
        }

        pub fn get_by_id(&self, id: &str) -> Option<&Contact> {
            self.contacts.iter().find(|c| c.id == id)
        }
    }

    impl<'a> IntoIterator for &'a ExtractionResult {
        type Item = &'a Contact;
        type IntoIter = std::slice::Iter<'a, Contact>;

        fn into_iter(self) -> Self::IntoIter {
            self.contacts.iter()
        }
    }

}

// --- 工具函数 ---
pub mod utils {
    use crate::types::Millis;
    use chrono::{DateTime, Local, TimeZone};
    use regex::Regex;
    use std::ops::Range;
    use std::sync::OnceLock;

    pub static RE_THINKING: OnceLock<Regex> = OnceLock::new();
    pub static RE_HTML_TAG: OnceLock<Regex> = OnceLock::new();

    pub const PREVIEW_MAX_CHARS: usize = 50;

    fn thinking_re() -> &'static Regex {
        RE_THINKING.get_or_init(|| {
            Regex::new(r"(?is)<think>.*?</think>|<thinking>.*?</thinking>").unwrap()
        })
    }

    /// 移除 `<think>` / `<thinking>` 块及其内容
    pub fn strip_thinking(text: &str) -> String {
        thinking_re().replace_all(text, "").into_owned()
    }

    /// 原文中所有思考块的字节区间
    pub fn thinking_spans(text: &str) -> Vec<Range<usize>> {
        thinking_re().find_iter(text).map(|m| m.range()).collect()
    }

    /// 截断字符串 (按字符计)
    pub fn truncate_str(s: &str, max_chars: usize) -> String {
        let mut chars = s.char_indices();
        match chars.nth(max_chars) {
            Some((cut, _)) => format!("{}...", &s[..cut]),
            None => s.to_string(),
        }
    }

    /// 群成员数量 (成员串格式: 我、张三、李四)
    pub fn member_count(members: &str) -> usize {
        members.split('、').filter(|m| !m.trim().is_empty()).count()
    }

    /// 清洗预览中的 HTML 片段
    pub fn normalize_html_preview(content: &str) -> String {
        if content.contains("<img") {
            return "[图片]".to_string();
        }
        if content.contains("<video") {
            return "[视频]".to_string();
        }
        if content.contains("<audio") {
            return "[音频]".to_string();
        }
        let re = RE_HTML_TAG.get_or_init(|| Regex::new(r"<[^>]*>").unwrap());
        if !re.is_match(content) {
            return content.to_string();
        }
        let cleaned = re.replace_all(content, "").replace("&nbsp;", " ");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            "[图文消息]".to_string()
        } else {
            cleaned.to_string()
        }
    }

    /// 相对时间：刚刚 / N分钟前 / N小时前 / N天前 / M月D日
    pub fn format_time(ts: Option<Millis>, now: DateTime<Local>) -> String {
        let date = ts
            .and_then(|t| Local.timestamp_millis_opt(t).single())
            .unwrap_or(now);

        let diff = now.signed_duration_since(date);
        let mins = diff.num_minutes();
        let hours = diff.num_hours();
        let days = diff.num_days();

        if days.abs() > 365 {
            return date.format("%-m月%-d日").to_string();
        }

        if mins < 1 {
            "刚刚".to_string()
        } else if mins < 60 {
            format!("{}分钟前", mins)
        } else if hours < 24 {
            format!("{}小时前", hours)
        } else if days < 7 {
            format!("{}天前", days)
        } else {
            date.format("%-m月%-d日").to_string()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::Duration;

        #[test]
        fn strip_thinking_is_case_insensitive_and_multiline() {
            let text = "a<THINK>x\ny</THINK>b<thinking>[好友id|A|1]</thinking>c";
            assert_eq!(strip_thinking(text), "abc");
            assert_eq!(thinking_spans(text).len(), 2);
        }

        #[test]
        fn truncate_counts_chars() {
            let s = "a".repeat(60);
            let t = truncate_str(&s, 50);
            assert_eq!(t.chars().count(), 53);
            assert!(t.ends_with("..."));
            assert_eq!(truncate_str("你好", 2), "你好");
            assert_eq!(truncate_str("你好世界", 2), "你好...");
        }

        #[test]
        fn html_preview_labels() {
            assert_eq!(normalize_html_preview(r#"<img src="x.png">"#), "[图片]");
            assert_eq!(normalize_html_preview("<video src=v>"), "[视频]");
            assert_eq!(normalize_html_preview("<audio>"), "[音频]");
            assert_eq!(normalize_html_preview("<b>hi</b>&nbsp;there"), "hi there");
            assert_eq!(normalize_html_preview("<div> </div>"), "[图文消息]");
            assert_eq!(normalize_html_preview("1 < 2"), "1 < 2");
        }

        #[test]
        fn member_count_ignores_blank_entries() {
            assert_eq!(member_count("我、张三、、李四"), 3);
            assert_eq!(member_count(""), 0);
        }

        #[test]
        fn relative_time_buckets() {
            let now = Local.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
            let ago = |d: Duration| Some((now - d).timestamp_millis());

            assert_eq!(format_time(None, now), "刚刚");
            assert_eq!(format_time(ago(Duration::seconds(30)), now), "刚刚");
            assert_eq!(format_time(ago(Duration::minutes(5)), now), "5分钟前");
            assert_eq!(format_time(ago(Duration::hours(3)), now), "3小时前");
            assert_eq!(format_time(ago(Duration::days(2)), now), "2天前");
            assert_eq!(format_time(ago(Duration::days(10)), now), "6月5日");
            assert_eq!(format_time(ago(Duration::days(400)), now), "5月12日");
        }
    }
}

// --- 错误类型 ---
pub mod error {
    use thiserror::Error;

    /// 需要跨越模块边界区分的错误类别
    #[derive(Debug, Error)]
    pub enum PhoneError {
        /// 宿主接口缺失或尚未就绪，只做延迟重试
        #[error("宿主未就绪: {0}")]
        HostNotReady(String),

        /// 整轮提取中出现的意外错误，界面退回空列表
        #[error("提取联系人信息失败: {0}")]
        ExtractionFailed(String),

        /// 改写宿主消息失败，批量操作中已完成的修改不回滚
        #[error("修改第 {index} 条消息失败: {reason}")]
        WriteBack { index: usize, reason: String },

        #[error("配置错误: {0}")]
        Config(String),

        #[error("已读记录存储失败: {0}")]
        Store(String),
    }
}

// --- 配置 ---
pub mod config {
    use serde::{Deserialize, Serialize};
    use std::path::Path;
    use std::time::Duration;

    pub const DEFAULT_CONFIG: &str = r#"
# 两次渲染之间的最短间隔 (毫秒)
render_cooldown_ms = 1000

# 增量渲染模式下的冷却时间
incremental_cooldown_ms = 3000

# 检测到群聊刷屏时的冷却时间
group_burst_cooldown_ms = 500

# 发送消息后兜底刷新的延迟
delayed_render_ms = 2000

# 有增量渲染器时是否优先增量更新
use_incremental_render = true

# 判断群聊刷屏时检查的最近消息条数
group_scan_depth = 5

# 消息预览最大字数
preview_max_chars = 50

# 对方消息的排序加权
peer_weight_bias = 100000

[binding]
# 连续重试次数，超过后进入慢速循环
max_attempts = 10

# 线性退避步长
backoff_step_ms = 1000

# 慢速循环的等待时间
slow_cycle_ms = 30000

# 启动后多久仍未绑定才开启轮询
polling_grace_ms = 30000

# 轮询间隔
polling_interval_ms = 2000
"#;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        pub render_cooldown_ms: u64,
        pub incremental_cooldown_ms: u64,
        pub group_burst_cooldown_ms: u64,
        pub delayed_render_ms: u64,
        pub use_incremental_render: bool,
        pub group_scan_depth: usize,
        pub preview_max_chars: usize,
        pub peer_weight_bias: i64,
        pub binding: BindingConfig,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BindingConfig {
        pub max_attempts: u32,
        pub backoff_step_ms: u64,
        pub slow_cycle_ms: u64,
        pub polling_grace_ms: u64,
        pub polling_interval_ms: u64,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                render_cooldown_ms: 1000,
                incremental_cooldown_ms: 3000,
                group_burst_cooldown_ms: 500,
                delayed_render_ms: 2000,
                use_incremental_render: true,
                group_scan_depth: 5,
                preview_max_chars: 50,
                peer_weight_bias: 100_000,
                binding: BindingConfig::default(),
            }
        }
    }

    impl Default for BindingConfig {
        fn default() -> Self {
            Self {
                max_attempts: 10,
                backoff_step_ms: 1000,
                slow_cycle_ms: 30_000,
                polling_grace_ms: 30_000,
                polling_interval_ms: 2000,
            }
        }
    }

    impl Config {
        /// 读取 `dir/config.toml`，不存在时写出默认配置
        pub fn load(dir: &Path) -> anyhow::Result<Self> {
            let path = dir.join("config.toml");
            if !path.exists() {
                std::fs::create_dir_all(dir)?;
                std::fs::write(&path, DEFAULT_CONFIG)?;
                return Ok(Self::default());
            }
            let text = std::fs::read_to_string(&path)?;
            toml::from_str(&text)
                .map_err(|e| crate::error::PhoneError::Config(e.to_string()).into())
        }

        pub fn load_or_default(dir: &Path) -> Self {
            Self::load(dir).unwrap_or_else(|e| {
                log::warn!("[配置] 读取失败，使用默认配置: {}", e);
                Self::default()
            })
        }

        pub fn render_cooldown(&self) -> Duration {
            Duration::from_millis(self.render_cooldown_ms)
        }

        pub fn incremental_cooldown(&self) -> Duration {
            Duration::from_millis(self.incremental_cooldown_ms)
        }

        pub fn group_burst_cooldown(&self) -> Duration {
            Duration::from_millis(self.group_burst_cooldown_ms)
        }

        pub fn delayed_render(&self) -> Duration {
            Duration::from_millis(self.delayed_render_ms)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn default_text_matches_default_struct() {
            let parsed: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
            assert_eq!(parsed, Config::default());
        }

        #[test]
        fn partial_file_keeps_other_defaults() {
            let parsed: Config = toml::from_str("render_cooldown_ms = 250\n[binding]\nmax_attempts = 3").unwrap();
            assert_eq!(parsed.render_cooldown(), Duration::from_millis(250));
            assert_eq!(parsed.binding.max_attempts, 3);
            assert_eq!(parsed.binding.polling_interval_ms, 2000);
            assert_eq!(parsed.delayed_render_ms, 2000);
        }

        #[test]
        fn load_writes_default_file() {
            let dir = tempfile::tempdir().unwrap();
            let cfg = Config::load(dir.path()).unwrap();
            assert_eq!(cfg, Config::default());
            assert!(dir.path().join("config.toml").exists());

            std::fs::write(dir.path().join("config.toml"), "render_cooldown_ms = \"x\"").unwrap();
            assert!(Config::load(dir.path()).is_err());
            assert_eq!(Config::load_or_default(dir.path()), Config::default());
        }
    }
}

// --- 标记解析 ---
pub mod token {
    // 把聊天正文切成带类型的标记。正则只做“匹配或不匹配”，格式不完整的标记不会报错。

    use regex::Regex;
    use std::ops::Range;
    use std::sync::OnceLock;

    pub static RE_FRIEND: OnceLock<Regex> = OnceLock::new();
    pub static RE_GROUP: OnceLock<Regex> = OnceLock::new();
    pub static RE_GROUP_MSG: OnceLock<Regex> = OnceLock::new();
    pub static RE_SELF_GROUP_MSG: OnceLock<Regex> = OnceLock::new();
    pub static RE_SELF_MSG: OnceLock<Regex> = OnceLock::new();
    pub static RE_PEER_MSG: OnceLock<Regex> = OnceLock::new();
    pub static RE_CANDIDATE: OnceLock<Regex> = OnceLock::new();

    /// 我方在标记中的固定称呼
    pub const SELF_NAME: &str = "我";

    pub fn friend_re() -> &'static Regex {
        RE_FRIEND.get_or_init(|| Regex::new(r"\[好友id\|([^|]+)\|([0-9]+)\]").unwrap())
    }

    pub fn group_re() -> &'static Regex {
        RE_GROUP.get_or_init(|| Regex::new(r"\[群聊\|([^|]+)\|([^|]+)\|([^\]]+)\]").unwrap())
    }

    pub fn group_msg_re() -> &'static Regex {
        RE_GROUP_MSG.get_or_init(|| {
            Regex::new(r"\[群聊消息\|([^|]+)\|([^|]+)\|([^|]+)\|([^\]]+)\]").unwrap()
        })
    }

    pub fn self_group_msg_re() -> &'static Regex {
        RE_SELF_GROUP_MSG
            .get_or_init(|| Regex::new(r"\[我方群聊消息\|我\|([^|]+)\|([^|]+)\|([^\]]+)\]").unwrap())
    }

    pub fn self_msg_re() -> &'static Regex {
        RE_SELF_MSG.get_or_init(|| Regex::new(r"\[我方消息\|我\|([^|]+)\|([^|]+)\|[^\]]+\]").unwrap())
    }

    pub fn peer_msg_re() -> &'static Regex {
        RE_PEER_MSG
            .get_or_init(|| Regex::new(r"\[对方消息\|([^|]+)\|([^|]+)\|[^|]+\|([^\]]+)\]").unwrap())
    }

    fn candidate_re() -> &'static Regex {
        RE_CANDIDATE.get_or_init(|| {
            Regex::new(r"\[(?:好友id|群聊消息|我方群聊消息|群聊)\|[^\]]*\]").unwrap()
        })
    }

    /// 建立实体用的标记
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Token {
        FriendAdd {
            name: String,
            number: String,
        },
        GroupAdd {
            name: String,
            group_id: String,
            members: String,
        },
        GroupMessage {
            group_id: String,
            sender: String,
            msg_type: String,
            content: String,
        },
        SelfGroupMessage {
            group_id: String,
            msg_type: String,
            content: String,
        },
        /// 看起来像实体标记但整体不匹配
        Unrecognized(String),
    }

    impl Token {
        /// 处理优先级，数值小的先处理
        pub fn priority(&self) -> u8 {
            match self {
                Token::FriendAdd { .. } => 0,
                Token::GroupAdd { .. } => 1,
                Token::GroupMessage { .. } => 2,
                Token::SelfGroupMessage { .. } => 3,
                Token::Unrecognized(_) => 4,
            }
        }
    }

    /// 切分一段 (已去除思考块的) 正文。
    ///
    /// 结果按种类分组：好友、群聊、群聊消息、我方群聊消息、无法识别，组内保持文中顺序。
    /// 提取器按这个顺序折叠，同一条消息里“先群聊消息后建群”的写法也会让建群标记先生效。
    pub fn tokenize(text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut spans: Vec<Range<usize>> = Vec::new();

        for c in friend_re().captures_iter(text) {
            spans.push(c.get(0).map(|m| m.range()).unwrap_or_default());
            tokens.push(Token::FriendAdd {
                name: c[1].to_string(),
                number: c[2].to_string(),
            });
        }

        for c in group_re().captures_iter(text) {
            spans.push(c.get(0).map(|m| m.range()).unwrap_or_default());
            tokens.push(Token::GroupAdd {
                name: c[1].to_string(),
                group_id: c[2].to_string(),
                members: c[3].to_string(),
            });
        }

        for c in group_msg_re().captures_iter(text) {
            spans.push(c.get(0).map(|m| m.range()).unwrap_or_default());
            tokens.push(Token::GroupMessage {
                group_id: c[1].to_string(),
                sender: c[2].to_string(),
                msg_type: c[3].to_string(),
                content: c[4].to_string(),
            });
        }

        for c in self_group_msg_re().captures_iter(text) {
            spans.push(c.get(0).map(|m| m.range()).unwrap_or_default());
            tokens.push(Token::SelfGroupMessage {
                group_id: c[1].to_string(),
                msg_type: c[2].to_string(),
                content: c[3].to_string(),
            });
        }

        for m in candidate_re().find_iter(text) {
            let r = m.range();
            if !spans.iter().any(|s| s.start < r.end && r.start < s.end) {
                tokens.push(Token::Unrecognized(m.as_str().to_string()));
            }
        }

        tokens
    }

    /// 消息作者
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Author {
        Me,
        Peer,
    }

    /// 一条聊天标记指向的联系人 (好友号或群号)
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MessageRef {
        pub number: String,
        pub author: Author,
    }

    /// 找出正文里所有私聊/群聊消息标记及其作者
    pub fn message_refs(text: &str) -> Vec<MessageRef> {
        let mut refs = Vec::new();

        for c in self_msg_re().captures_iter(text) {
            refs.push(MessageRef {
                number: c[1].to_string(),
                author: Author::Me,
            });
        }
        for c in peer_msg_re().captures_iter(text) {
            refs.push(MessageRef {
                number: c[2].to_string(),
                author: Author::Peer,
            });
        }
        for c in group_msg_re().captures_iter(text) {
            let author = if &c[2] == SELF_NAME {
                Author::Me
            } else {
                Author::Peer
            };
            refs.push(MessageRef {
                number: c[1].to_string(),
                author,
            });
        }
        for c in self_group_msg_re().captures_iter(text) {
            refs.push(MessageRef {
                number: c[1].to_string(),
                author: Author::Me,
            });
        }

        refs
    }

    /// 是否含有群聊相关标记 (建群或群消息)
    pub fn has_group_chat_token(text: &str) -> bool {
        group_msg_re().is_match(text) || self_group_msg_re().is_match(text) || group_re().is_match(text)
    }

    /// 是否含有好友/群聊添加标记
    pub fn has_add_token(text: &str) -> bool {
        friend_re().is_match(text) || group_re().is_match(text)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tokens_are_grouped_by_kind() {
            let text = "[群聊消息|9|Bob|text|hi][好友id|Alice|1001][群聊|闲聊|9|我、Bob]";
            let tokens = tokenize(text);
            let kinds: Vec<u8> = tokens.iter().map(Token::priority).collect();
            assert_eq!(kinds, vec![0, 1, 2]);
            assert_eq!(
                tokens[1],
                Token::GroupAdd {
                    name: "闲聊".into(),
                    group_id: "9".into(),
                    members: "我、Bob".into(),
                }
            );
        }

        #[test]
        fn malformed_tokens_become_unrecognized() {
            let tokens = tokenize("[好友id|Bob|abc] 以及 [群聊|缺字段]");
            assert_eq!(
                tokens,
                vec![
                    Token::Unrecognized("[好友id|Bob|abc]".into()),
                    Token::Unrecognized("[群聊|缺字段]".into()),
                ]
            );
        }

        #[test]
        fn self_group_message_requires_literal_me() {
            let tokens = tokenize("[我方群聊消息|我|3|text|好]");
            assert_eq!(
                tokens,
                vec![Token::SelfGroupMessage {
                    group_id: "3".into(),
                    msg_type: "text".into(),
                    content: "好".into(),
                }]
            );
        }

        #[test]
        fn message_refs_classify_authors() {
            let text = "[我方消息|我|1001|hi|12:00][对方消息|Alice|1001|text|hello][群聊消息|5|我|text|x]";
            let refs = message_refs(text);
            assert_eq!(refs.len(), 3);
            assert_eq!(refs[0].author, Author::Me);
            assert_eq!(refs[1].author, Author::Peer);
            assert_eq!(refs[1].number, "1001");
            assert_eq!(refs[2].author, Author::Me);
            assert_eq!(refs[2].number, "5");
        }

        #[test]
        fn group_chat_detection() {
            assert!(has_group_chat_token("[群聊消息|5|Bob|text|hi]"));
            assert!(!has_group_chat_token("[对方消息|Alice|1|text|hi]"));
            assert!(has_add_token("[好友id|A|1]"));
            assert!(!has_add_token("[好友id|A|１]"));
        }
    }
}

// --- 联系人提取 ---
pub mod extract {
    use crate::token::{Token, has_add_token, tokenize};
    use crate::types::{ChatMessage, Contact, ExtractionResult, Millis};
    use crate::utils::{PREVIEW_MAX_CHARS, normalize_html_preview, strip_thinking, truncate_str};
    use regex::Regex;
    use std::collections::HashMap;
    use std::sync::OnceLock;

    pub const NO_CHAT_RECORD: &str = "暂无聊天记录";
    pub const NO_GROUP_RECORD: &str = "暂无群聊记录";
    pub const FALLBACK_CONTENT: &str = "消息内容";

    /// 保持首次插入顺序的联系人表，覆盖写入不改变位置
    #[derive(Default)]
    struct ContactTable {
        order: Vec<Contact>,
        index: HashMap<String, usize>,
    }

    impl ContactTable {
        fn get_mut(&mut self, key: &str) -> Option<&mut Contact> {
            self.index.get(key).map(|&i| &mut self.order[i])
        }

        fn upsert(&mut self, contact: Contact) {
            match self.index.get(&contact.id) {
                Some(&i) => self.order[i] = contact,
                None => {
                    self.index.insert(contact.id.clone(), self.order.len());
                    self.order.push(contact);
                }
            }
        }

        /// 后出现的覆盖先出现的，同一条消息内不覆盖
        fn upsert_latest(&mut self, contact: Contact) {
            let newer = self
                .index
                .get(&contact.id)
                .map(|&i| self.order[i].last_seen_message_index < contact.last_seen_message_index)
                .unwrap_or(true);
            if newer {
                self.upsert(contact);
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct Extractor {
        pub preview_max_chars: usize,
    }

    impl Default for Extractor {
        fn default() -> Self {
            Self {
                preview_max_chars: PREVIEW_MAX_CHARS,
            }
        }
    }

    impl Extractor {
        pub fn new(preview_max_chars: usize) -> Self {
            Self { preview_max_chars }
        }

        /// 从整段聊天记录中提取好友与群聊。纯函数，重复调用结果一致。
        pub fn extract(&self, messages: &[ChatMessage]) -> ExtractionResult {
            let mut friends = ContactTable::default();
            let mut groups = ContactTable::default();

            for (index, message) in messages.iter().enumerate() {
                let ts = message.timestamp;
                let filtered = strip_thinking(&message.text);

                for token in tokenize(&filtered) {
                    match token {
                        Token::FriendAdd { name, number } => {
                            friends.upsert_latest(Contact::friend(&name, &number, index, ts));
                        }
                        Token::GroupAdd {
                            name,
                            group_id,
                            members,
                        } => {
                            groups.upsert_latest(Contact::group(&name, &group_id, &members, index, ts));
                        }
                        Token::GroupMessage {
                            group_id, sender, ..
                        } => fold_group_message(&mut groups, &group_id, &sender, index, ts),
                        Token::SelfGroupMessage { group_id, .. } => {
                            fold_group_message(&mut groups, &group_id, "我", index, ts)
                        }
                        Token::Unrecognized(_) => {}
                    }
                }
            }

            let mut contacts: Vec<Contact> = friends.order;
            contacts.extend(groups.order);
            contacts.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));

            for contact in contacts.iter_mut() {
                match self.last_message_for_contact(messages, contact) {
                    Some((preview, ts)) => {
                        contact.last_message_preview = preview;
                        contact.last_message_time = ts;
                    }
                    None => {
                        contact.last_message_preview = if contact.is_group() {
                            NO_GROUP_RECORD.to_string()
                        } else {
                            NO_CHAT_RECORD.to_string()
                        };
                    }
                }
            }

            ExtractionResult { contacts }
        }

        /// 从最新消息往前找第一条能匹配任一候选格式的消息。
        /// 候选顺序即优先级：同一条消息能被多种格式匹配时，靠前的格式胜出。
        pub fn last_message_for_contact(
            &self,
            messages: &[ChatMessage],
            contact: &Contact,
        ) -> Option<(String, Option<Millis>)> {
            let patterns = preview_patterns(contact);

            for message in messages.iter().rev() {
                for re in &patterns {
                    let Some(content) = re
                        .captures_iter(&message.text)
                        .last()
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str())
                    else {
                        continue;
                    };
                    if content.is_empty() {
                        continue;
                    }
                    return Some((
                        truncate_str(content.trim(), self.preview_max_chars),
                        message.timestamp,
                    ));
                }
            }

            None
        }

        /// 提取一条消息的实际内容 (预览用)
        pub fn extract_actual_message_content(&self, text: &str) -> String {
            extract_actual_message_content(text, self.preview_max_chars)
        }
    }

    /// 使用默认配置提取
    pub fn extract(messages: &[ChatMessage]) -> ExtractionResult {
        Extractor::default().extract(messages)
    }

    fn fold_group_message(
        groups: &mut ContactTable,
        group_id: &str,
        sender: &str,
        index: usize,
        ts: Option<Millis>,
    ) {
        let key = format!("group_{}", group_id);
        match groups.get_mut(&key) {
            Some(existing) => {
                if let Some(members) = existing.members.as_mut()
                    && !members.contains(sender)
                {
                    members.push('、');
                    members.push_str(sender);
                }
                if existing.last_seen_message_index < index {
                    existing.last_seen_message_index = index;
                    existing.add_time = ts;
                }
            }
            None => {
                let name = format!("群聊{}", group_id);
                groups.upsert(Contact::group(&name, group_id, sender, index, ts));
            }
        }
    }

    fn preview_patterns(contact: &Contact) -> Vec<Regex> {
        let num = regex::escape(&contact.number);
        let name = regex::escape(&contact.display_name);

        let sources = if contact.is_group() {
            vec![
                format!(r"\[我方群聊消息\|我\|{num}\|[^|]+\|([^\]]+)\]"),
                format!(r"\[群聊消息\|{num}\|[^|]+\|[^|]+\|([^\]]+)\]"),
                // 旧格式
                format!(r"\[我方群聊消息\|{name}\|{num}\|[^|]+\|([^|]+)\|[^\]]+\]"),
                format!(r"\[对方群聊消息\|{name}\|{num}\|[^|]+\|[^|]+\|([^\]]+)\]"),
            ]
        } else {
            vec![
                format!(r"\[我方消息\|我\|{num}\|([^|]+)\|[^\]]+\]"),
                format!(r"\[对方消息\|{name}\|{num}\|[^|]+\|([^\]]+)\]"),
            ]
        };

        sources.iter().filter_map(|s| Regex::new(s).ok()).collect()
    }

    // --- 内容预览 ---

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ContentKind {
        Plain,
        Sticker,
        Voice,
        RedEnvelope,
    }

    static RE_CONTENT: OnceLock<Vec<(ContentKind, Regex)>> = OnceLock::new();

    fn content_patterns() -> &'static [(ContentKind, Regex)] {
        RE_CONTENT.get_or_init(|| {
            [
                (ContentKind::Plain, r"\[我方消息\|[^|]+\|[^|]+\|([^|]+)\|[^\]]+\]"),
                (
                    ContentKind::Plain,
                    r"\[我方群聊消息\|[^|]+\|[^|]+\|[^|]+\|([^|]+)\|[^\]]+\]",
                ),
                (ContentKind::Plain, r"\[对方消息\|[^|]+\|[^|]+\|[^|]+\|([^\]]+)\]"),
                (
                    ContentKind::Plain,
                    r"\[对方群聊消息\|[^|]+\|[^|]+\|[^|]+\|[^|]+\|([^\]]+)\]",
                ),
                (ContentKind::Plain, r"\[群聊消息\|[^|]+\|[^|]+\|[^|]+\|([^\]]+)\]"),
                (ContentKind::Sticker, r"\[表情包\|[^|]+\|[^\]]+\]"),
                (ContentKind::Voice, r"\[语音\|[^|]+\|([^\]]+)\]"),
                (ContentKind::RedEnvelope, r"\[红包\|([^|]+)\|[^\]]+\]"),
            ]
            .into_iter()
            .map(|(k, s)| (k, Regex::new(s).unwrap()))
            .collect()
        })
    }

    /// 提取一条消息的实际内容。
    ///
    /// 先去掉思考块，再按固定优先级逐个尝试格式：第一个在正文中有匹配的格式胜出，
    /// 取该格式在正文中的最后一处匹配。都不匹配时退回第一行非空文本。
    pub fn extract_actual_message_content(text: &str, max_chars: usize) -> String {
        let cleaned = strip_thinking(text);

        for (kind, re) in content_patterns() {
            let Some(caps) = re.captures_iter(&cleaned).last() else {
                continue;
            };
            let raw = caps
                .get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let content = normalize_html_preview(raw);
            let labeled = match kind {
                ContentKind::RedEnvelope => format!("红包：{}", content),
                ContentKind::Sticker => "表情包".to_string(),
                ContentKind::Voice => format!("语音：{}", content),
                ContentKind::Plain => content,
            };
            return truncate_str(&labeled, max_chars);
        }

        let first_line = cleaned
            .trim()
            .lines()
            .map(str::trim_end)
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        if first_line.is_empty() {
            FALLBACK_CONTENT.to_string()
        } else {
            truncate_str(first_line, max_chars)
        }
    }

    /// 最近一条不是加好友/建群的消息的内容预览
    pub fn last_chat_record(messages: &[ChatMessage], max_chars: usize) -> String {
        messages
            .iter()
            .rev()
            .find(|m| !has_add_token(&m.text))
            .map(|m| extract_actual_message_content(&m.text, max_chars))
            .unwrap_or_else(|| NO_CHAT_RECORD.to_string())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::types::ContactKind;

        fn msgs(texts: &[&str]) -> Vec<ChatMessage> {
            ChatMessage::sequence(texts)
        }

        #[test]
        fn empty_transcript_yields_nothing() {
            assert!(extract(&[]).is_empty());
        }

        #[test]
        fn basic_friend_extraction() {
            let m = msgs(&[
                "[好友id|Alice|1001]",
                "[我方消息|我|1001|hi|12:00]",
                "[对方消息|Alice|1001|text|hello]",
            ]);
            let r = extract(&m);
            assert_eq!(r.len(), 1);
            let c = &r.contacts[0];
            assert_eq!(c.kind, ContactKind::Friend);
            assert_eq!(c.id, "friend_Alice_1001");
            assert_eq!(c.last_message_preview, "hello");
            assert_eq!(c.last_seen_message_index, 0);
        }

        #[test]
        fn group_is_synthesized_from_message() {
            let r = extract(&msgs(&["[群聊消息|55|Bob|text|hi all]"]));
            assert_eq!(r.len(), 1);
            let g = &r.contacts[0];
            assert_eq!(g.kind, ContactKind::Group);
            assert_eq!(g.id, "group_55");
            assert_eq!(g.display_name, "群聊55");
            assert_eq!(g.members.as_deref(), Some("Bob"));
            assert_eq!(g.last_message_preview, "hi all");
        }

        #[test]
        fn later_friend_token_wins() {
            let m = msgs(&[
                "",
                "",
                "[好友id|Alice|1001]",
                "",
                "",
                "再次 [好友id|Alice|1001]",
            ]);
            let r = extract(&m);
            assert_eq!(r.len(), 1);
            assert_eq!(r.contacts[0].last_seen_message_index, 5);
        }

        #[test]
        fn friends_dedup_by_name_and_number() {
            let r = extract(&msgs(&["[好友id|Alice|1001]", "[好友id|Alicia|1001]"]));
            assert_eq!(r.len(), 2);
        }

        #[test]
        fn groups_dedup_by_id_only() {
            let r = extract(&msgs(&["[群聊|甲|7|我、A]", "[群聊|乙|7|我、B]"]));
            assert_eq!(r.len(), 1);
            assert_eq!(r.contacts[0].display_name, "乙");
        }

        #[test]
        fn group_members_accrue_in_first_seen_order() {
            let m = msgs(&[
                "[群聊消息|8|A|text|1]",
                "[群聊消息|8|B|text|2]",
                "[群聊消息|8|A|text|3]",
                "[群聊消息|8|C|text|4]",
            ]);
            let r = extract(&m);
            let g = &r.contacts[0];
            assert_eq!(g.member_names(), vec!["A", "B", "C"]);
            assert_eq!(g.last_seen_message_index, 3);
        }

        #[test]
        fn self_group_message_adds_me_once() {
            let m = msgs(&[
                "[群聊|项目组|12|张三、李四]",
                "[我方群聊消息|我|12|text|收到]",
                "[我方群聊消息|我|12|text|好的]",
            ]);
            let g = &extract(&m).contacts[0];
            assert_eq!(g.members.as_deref(), Some("张三、李四、我"));
            assert_eq!(g.display_name, "项目组");
            assert_eq!(g.last_message_preview, "好的");
        }

        #[test]
        fn tokens_inside_thinking_are_ignored() {
            let m = msgs(&["<thinking>[好友id|Ghost|9]</thinking>[好友id|Real|1]"]);
            let r = extract(&m);
            assert_eq!(r.len(), 1);
            assert_eq!(r.contacts[0].display_name, "Real");
        }

        #[test]
        fn group_tokens_inside_thinking_are_ignored() {
            let m = msgs(&[
                "<thinking>[群聊|暗号群|66|我、A]</thinking>",
                "<think>[群聊消息|77|Ghost|text|嘘]</think>",
            ]);
            assert!(extract(&m).is_empty());

            let m = msgs(&[
                "[群聊|项目组|12|张三]",
                "<thinking>[群聊消息|12|Ghost|text|计划]</thinking>[群聊消息|12|李四|text|到]",
            ]);
            let g = &extract(&m).contacts[0];
            assert_eq!(g.member_names(), vec!["张三", "李四"]);
        }

        #[test]
        fn host_json_without_index_uses_positions() {
            let m: Vec<ChatMessage> = serde_json::from_str(
                r#"[{"mes":"[好友id|Alice|1001]"},{"mes":"x"},{"mes":"[好友id|Alice|1001] again"}]"#,
            )
            .unwrap();
            let r = extract(&m);
            assert_eq!(r.len(), 1);
            assert_eq!(r.contacts[0].last_seen_message_index, 2);
        }

        #[test]
        fn full_width_digits_are_not_friend_numbers() {
            assert!(extract(&msgs(&["[好友id|A|１２３]"])).is_empty());
            assert_eq!(extract(&msgs(&["[好友id|A|123]"])).len(), 1);
        }

        #[test]
        fn sorted_by_add_time_descending() {
            let m = vec![
                ChatMessage::new("[好友id|Old|1]").with_timestamp(1_000),
                ChatMessage::new("[好友id|New|2]").with_timestamp(5_000),
                ChatMessage::new("[群聊|群|3|我]").with_timestamp(3_000),
            ];
            let names: Vec<_> = extract(&m)
                .contacts
                .into_iter()
                .map(|c| c.display_name)
                .collect();
            assert_eq!(names, vec!["New", "群", "Old"]);
        }

        #[test]
        fn extraction_is_idempotent() {
            let m = msgs(&[
                "[好友id|Alice|1001][群聊|群|3|我、Alice]",
                "[群聊消息|3|Bob|text|嗨]",
                "[对方消息|Alice|1001|text|在吗]",
            ]);
            assert_eq!(extract(&m), extract(&m));
        }

        #[test]
        fn preview_truncated_to_fifty_chars() {
            let peer = format!("[对方消息|Alice|1001|text|{}]", "x".repeat(60));
            let m = msgs(&["[好友id|Alice|1001]", peer.as_str()]);
            let c = &extract(&m).contacts[0];
            assert_eq!(c.last_message_preview.chars().count(), 53);
            assert!(c.last_message_preview.ends_with("..."));
        }

        #[test]
        fn preview_pattern_order_decides_within_message() {
            let m = msgs(&[
                "[好友id|Alice|1001]",
                "[对方消息|Alice|1001|text|对方说][我方消息|我|1001|我说|12:00]",
            ]);
            assert_eq!(extract(&m).contacts[0].last_message_preview, "我说");
        }

        #[test]
        fn contact_without_messages_gets_placeholder() {
            let r = extract(&msgs(&["[好友id|A|1][群聊|G|2|我]"]));
            let friend = r.get_by_number("1").unwrap();
            let group = r.get_by_number("2").unwrap();
            assert_eq!(friend.last_message_preview, NO_CHAT_RECORD);
            assert_eq!(group.last_message_preview, NO_GROUP_RECORD);
        }

        #[test]
        fn content_first_matching_format_wins_then_last_match() {
            let text = "[对方消息|A|1|text|第一][语音|A|你好][对方消息|A|1|text|第二]";
            assert_eq!(extract_actual_message_content(text, 50), "第二");

            let voice = "[语音|A|在吗][红包|88|恭喜]";
            assert_eq!(extract_actual_message_content(voice, 50), "语音：在吗");
            assert_eq!(
                extract_actual_message_content("[红包|88|恭喜]", 50),
                "红包：88"
            );
            assert_eq!(
                extract_actual_message_content("[表情包|A|url]", 50),
                "表情包"
            );
        }

        #[test]
        fn content_html_is_normalized() {
            let text = r#"[对方消息|A|1|text|<img src="a.png">]"#;
            assert_eq!(extract_actual_message_content(text, 50), "[图片]");
        }

        #[test]
        fn content_falls_back_to_first_line() {
            let text = "<think>想想</think>\n\n  第一行\n第二行";
            assert_eq!(extract_actual_message_content(text, 50), "第一行");
            assert_eq!(
                extract_actual_message_content("<think>只有思考</think>", 50),
                FALLBACK_CONTENT
            );
        }

        #[test]
        fn last_chat_record_skips_add_messages() {
            let m = msgs(&["[对方消息|A|1|text|最近的话]", "[好友id|B|2]"]);
            assert_eq!(last_chat_record(&m, 50), "最近的话");
            assert_eq!(last_chat_record(&msgs(&["[好友id|B|2]"]), 50), NO_CHAT_RECORD);
        }
    }
}

// --- 标记删除 ---
pub mod removal {
    // 删除好友/群聊时改写宿主消息。思考块里的内容一律原样保留。

    use crate::types::Contact;
    use crate::utils::thinking_spans;
    use regex::Regex;

    /// `[start, end)` 是否完整落在某个思考块内
    pub fn is_inside_thinking(text: &str, start: usize, end: usize) -> bool {
        thinking_spans(text)
            .iter()
            .any(|s| start >= s.start && end <= s.end)
    }

    /// 删除原文中所有不在思考块内的匹配
    pub fn remove_matches_outside_thinking(text: &str, pattern: &Regex) -> String {
        let spans = thinking_spans(text);
        let removals: Vec<(usize, usize)> = pattern
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .filter(|&(start, end)| !spans.iter().any(|s| start >= s.start && end <= s.end))
            .collect();

        let mut result = text.to_string();
        // 从后往前删，前面的偏移保持有效
        for (start, end) in removals.into_iter().rev() {
            result.replace_range(start..end, "");
        }
        result
    }

    /// 删除联系人时需要清理的全部标记
    pub fn contact_patterns(contact: &Contact) -> Vec<Regex> {
        let num = regex::escape(&contact.number);
        let name = regex::escape(&contact.display_name);

        let sources = if contact.is_group() {
            vec![
                format!(r"\[群聊\|[^|]+\|{num}\|[^\]]+\]"),
                format!(r"\[群聊消息\|{num}\|[^|]+\|[^|]+\|[^\]]+\]"),
                format!(r"\[我方群聊消息\|我\|{num}\|[^|]+\|[^\]]+\]"),
            ]
        } else {
            vec![
                format!(r"\[好友id\|{name}\|{num}\]"),
                format!(r"\[我方消息\|我\|{num}\|[^|]+\|[^\]]+\]"),
                format!(r"\[对方消息\|{name}\|{num}\|[^|]+\|[^\]]+\]"),
            ]
        };

        sources.iter().filter_map(|s| Regex::new(s).ok()).collect()
    }

    /// 从一条消息中移除某个联系人的全部标记，返回 `None` 表示无需改写
    pub fn strip_contact_tokens(text: &str, contact: &Contact) -> Option<String> {
        let mut current = text.to_string();
        for re in contact_patterns(contact) {
            current = remove_matches_outside_thinking(&current, &re);
        }
        (current != text).then_some(current)
    }

}

// --- 排序权重与未读 ---
pub mod weight {
    use crate::token::{Author, message_refs};
    use crate::types::{ChatMessage, Contact};
    use crate::utils::strip_thinking;
    use anyhow::Context;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// 对方发来的消息额外加权，保证“对方回复了”排在“我发了没回”之前
    pub const PEER_WEIGHT_BIAS: i64 = 100_000;

    /// 已读权重的持久化 (按好友号/群号)
    pub trait ReadStateStore: Send + Sync {
        fn last_read(&self, id: &str) -> Option<i64>;
        fn set_last_read(&self, id: &str, weight: i64) -> anyhow::Result<()>;
    }

    #[derive(Debug, Default)]
    pub struct MemoryReadStore {
        data: Mutex<HashMap<String, i64>>,
    }

    impl MemoryReadStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl ReadStateStore for MemoryReadStore {
        fn last_read(&self, id: &str) -> Option<i64> {
            self.data.lock().ok()?.get(id).copied()
        }

        fn set_last_read(&self, id: &str, weight: i64) -> anyhow::Result<()> {
            self.data
                .lock()
                .map_err(|_| anyhow::anyhow!("已读记录锁已损坏"))?
                .insert(id.to_string(), weight);
            Ok(())
        }
    }

    /// 以 JSON 文件保存的已读记录，每次写入即落盘
    #[derive(Debug)]
    pub struct JsonReadStore {
        data: Mutex<HashMap<String, i64>>,
        path: PathBuf,
    }

    impl JsonReadStore {
        pub fn new(dir: &Path) -> Self {
            let path = dir.join("read_state.json");
            let data = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();
            Self {
                data: Mutex::new(data),
                path,
            }
        }

        fn save(&self, data: &HashMap<String, i64>) -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(data)?;
            std::fs::write(&self.path, json)
                .with_context(|| format!("写入 {} 失败", self.path.display()))
        }
    }

    impl ReadStateStore for JsonReadStore {
        fn last_read(&self, id: &str) -> Option<i64> {
            self.data.lock().ok()?.get(id).copied()
        }

        fn set_last_read(&self, id: &str, weight: i64) -> anyhow::Result<()> {
            let mut data = self
                .data
                .lock()
                .map_err(|_| anyhow::anyhow!("已读记录锁已损坏"))?;
            data.insert(id.to_string(), weight);
            self.save(&data)
        }
    }

    /// 会话内的最大权重表，只增不减，不持久化
    #[derive(Debug, Clone)]
    pub struct WeightTracker {
        weights: HashMap<String, i64>,
        peer_bias: i64,
    }

    impl Default for WeightTracker {
        fn default() -> Self {
            Self::new(PEER_WEIGHT_BIAS)
        }
    }

    impl WeightTracker {
        pub fn new(peer_bias: i64) -> Self {
            Self {
                weights: HashMap::new(),
                peer_bias,
            }
        }

        /// 记录一条消息，返回该联系人当前的最大权重
        pub fn observe(&mut self, id: &str, index: usize, author: Author) -> i64 {
            let mut weight = index as i64;
            if author == Author::Peer {
                weight += self.peer_bias;
            }
            let entry = self.weights.entry(id.to_string()).or_insert(weight);
            *entry = (*entry).max(weight);
            *entry
        }

        pub fn scan(&mut self, messages: &[ChatMessage]) {
            for (index, message) in messages.iter().enumerate() {
                for r in message_refs(&strip_thinking(&message.text)) {
                    self.observe(&r.number, index, r.author);
                }
            }
        }

        pub fn weight(&self, id: &str) -> Option<i64> {
            self.weights.get(id).copied()
        }

        /// 当前权重高于已读权重即为未读；从未读过的按 0 计
        pub fn has_unread(&self, id: &str, store: &dyn ReadStateStore) -> bool {
            match self.weight(id) {
                Some(w) => w > store.last_read(id).unwrap_or(0),
                None => false,
            }
        }

        pub fn mark_read(&self, id: &str, store: &dyn ReadStateStore) -> anyhow::Result<()> {
            match self.weight(id) {
                Some(w) => store.set_last_read(id, w),
                None => Ok(()),
            }
        }

        pub fn apply_unread(&self, contacts: &mut [Contact], store: &dyn ReadStateStore) {
            for c in contacts.iter_mut() {
                c.has_unread = self.has_unread(&c.number, store);
            }
        }

        /// 按权重倒序排列，无权重的保持原有顺序排在最后
        pub fn sort_by_weight(&self, contacts: &mut [Contact]) {
            contacts.sort_by_key(|c| std::cmp::Reverse(self.weight(&c.number).unwrap_or(i64::MIN)));
        }
    }

}

// --- 宿主接口 ---
pub mod host {
    // 核心只通过这里的 trait 与宿主 (酒馆) 交互，每种宿主环境各写一个适配器。

    use crate::types::{ChatMessage, Millis};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, RwLock};
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum HostEvent {
        /// 宿主收到新消息 (消息 id)
        MessageReceived(u64),
        MessageSent(u64),
        ChatChanged,
    }

    /// 读取聊天记录
    pub trait ChatHost: Send + Sync {
        fn is_ready(&self) -> bool {
            true
        }

        fn messages(&self) -> anyhow::Result<Vec<ChatMessage>>;

        fn message_count(&self) -> anyhow::Result<usize> {
            Ok(self.messages()?.len())
        }
    }

    /// 改写单条消息，每次调用互相独立
    pub trait TranscriptWriter: Send + Sync {
        fn set_message_text(&self, index: usize, text: &str) -> anyhow::Result<()>;
    }

    /// 事件订阅句柄，drop 时自动退订
    pub struct Subscription {
        unsubscribe: Option<Box<dyn FnOnce() + Send>>,
    }

    impl Subscription {
        pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
            Self {
                unsubscribe: Some(Box::new(f)),
            }
        }

        pub fn unsubscribe(mut self) {
            if let Some(f) = self.unsubscribe.take() {
                f();
            }
        }
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            if let Some(f) = self.unsubscribe.take() {
                f();
            }
        }
    }

    impl std::fmt::Debug for Subscription {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Subscription")
                .field("active", &self.unsubscribe.is_some())
                .finish()
        }
    }

    pub trait EventSource: Send + Sync {
        fn on_message_received(&self, tx: UnboundedSender<HostEvent>) -> anyhow::Result<Subscription>;
    }

    /// 事件系统的探测方式，按声明顺序为优先级
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Strategy {
        /// 宿主全局上下文访问器
        HostContext,
        /// 全局的事件注册函数 + 事件类型表
        GlobalEventPair,
        /// 父窗口上的事件对象
        ParentWindow,
    }

    impl Strategy {
        pub fn label(&self) -> &'static str {
            match self {
                Strategy::HostContext => "宿主上下文",
                Strategy::GlobalEventPair => "全局事件函数",
                Strategy::ParentWindow => "父窗口事件",
            }
        }
    }

    pub trait EventSourceLocator: Send + Sync {
        fn strategy(&self) -> Strategy;
        fn detect(&self) -> Option<Arc<dyn EventSource>>;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ToastLevel {
        Info,
        Success,
        Warning,
        Error,
    }

    /// 非阻塞的提示 (几秒后自动消失)
    pub trait Notifier: Send + Sync {
        fn toast(&self, level: ToastLevel, message: &str);
    }

    /// 只写日志的提示器
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LogNotifier;

    impl Notifier for LogNotifier {
        fn toast(&self, level: ToastLevel, message: &str) {
            match level {
                ToastLevel::Error => log::error!("[提示] {}", message),
                ToastLevel::Warning => log::warn!("[提示] {}", message),
                ToastLevel::Info | ToastLevel::Success => log::info!("[提示] {}", message),
            }
        }
    }

    // --- 进程内宿主 ---

    type Subscribers = Arc<Mutex<Vec<(u64, UnboundedSender<HostEvent>)>>>;

    /// 进程内的宿主实现：内存中的聊天记录 + 事件广播
    pub struct LocalHost {
        messages: RwLock<Vec<ChatMessage>>,
        subscribers: Subscribers,
        next_id: AtomicU64,
        ready: AtomicBool,
        events_enabled: AtomicBool,
    }

    impl LocalHost {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: RwLock::new(Vec::new()),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                next_id: AtomicU64::new(0),
                ready: AtomicBool::new(true),
                events_enabled: AtomicBool::new(true),
            })
        }

        pub fn with_messages<S: AsRef<str>>(texts: &[S]) -> Arc<Self> {
            let host = Self::new();
            if let Ok(mut m) = host.messages.write() {
                *m = ChatMessage::sequence(texts);
            }
            host
        }

        pub fn set_ready(&self, ready: bool) {
            self.ready.store(ready, Ordering::SeqCst);
        }

        /// 关闭后探测不到事件系统，用于模拟宿主加载慢
        pub fn set_events_enabled(&self, enabled: bool) {
            self.events_enabled.store(enabled, Ordering::SeqCst);
        }

        pub fn events_enabled(&self) -> bool {
            self.events_enabled.load(Ordering::SeqCst)
        }

        /// 追加一条消息并广播，返回消息下标
        pub fn push(&self, text: &str, timestamp: Option<Millis>) -> usize {
            let index = match self.messages.write() {
                Ok(mut m) => {
                    let index = m.len();
                    m.push(ChatMessage {
                        text: text.to_string(),
                        timestamp,
                    });
                    index
                }
                Err(_) => return 0,
            };
            self.emit(HostEvent::MessageReceived(index as u64));
            index
        }

        /// 只追加不广播，模拟事件丢失
        pub fn push_silent(&self, text: &str) -> usize {
            match self.messages.write() {
                Ok(mut m) => {
                    let index = m.len();
                    m.push(ChatMessage::new(text));
                    index
                }
                Err(_) => 0,
            }
        }

        pub fn emit(&self, event: HostEvent) {
            if let Ok(mut subs) = self.subscribers.lock() {
                subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            }
        }

        pub fn subscriber_count(&self) -> usize {
            self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
        }

        pub fn locator(self: &Arc<Self>, strategy: Strategy) -> LocalLocator {
            LocalLocator {
                host: self.clone(),
                strategy,
            }
        }
    }

    impl ChatHost for LocalHost {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn messages(&self) -> anyhow::Result<Vec<ChatMessage>> {
            if !self.is_ready() {
                return Err(crate::error::PhoneError::HostNotReady("聊天数据不可用".into()).into());
            }
            self.messages
                .read()
                .map(|m| m.clone())
                .map_err(|_| anyhow::anyhow!("聊天记录锁已损坏"))
        }
    }

    impl TranscriptWriter for LocalHost {
        fn set_message_text(&self, index: usize, text: &str) -> anyhow::Result<()> {
            let mut m = self
                .messages
                .write()
                .map_err(|_| anyhow::anyhow!("聊天记录锁已损坏"))?;
            let msg = m
                .get_mut(index)
                .ok_or_else(|| anyhow::anyhow!("消息 {} 不存在", index))?;
            msg.text = text.to_string();
            Ok(())
        }
    }

    impl EventSource for LocalHost {
        fn on_message_received(&self, tx: UnboundedSender<HostEvent>) -> anyhow::Result<Subscription> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.subscribers
                .lock()
                .map_err(|_| anyhow::anyhow!("订阅表锁已损坏"))?
                .push((id, tx));

            let subs = self.subscribers.clone();
            Ok(Subscription::new(move || {
                if let Ok(mut s) = subs.lock() {
                    s.retain(|(sid, _)| *sid != id);
                }
            }))
        }
    }

    pub struct LocalLocator {
        host: Arc<LocalHost>,
        strategy: Strategy,
    }

    impl EventSourceLocator for LocalLocator {
        fn strategy(&self) -> Strategy {
            self.strategy
        }

        fn detect(&self) -> Option<Arc<dyn EventSource>> {
            if self.host.events_enabled() {
                Some(self.host.clone() as Arc<dyn EventSource>)
            } else {
                None
            }
        }
    }

}

// --- 事件绑定 ---
pub mod binding {
    // Unbound → Detecting → Bound，失败时进入 Retrying；启动宽限期过后仍未绑定，
    // 额外开启 Polling 兜底。重试永不放弃，轮询期间探测到事件系统会立即回到一次绑定尝试。

    use crate::config::BindingConfig;
    use crate::host::{EventSourceLocator, HostEvent, Strategy, Subscription};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BindingPolicy {
        pub max_attempts: u32,
        pub backoff_step: Duration,
        pub slow_cycle: Duration,
        pub polling_grace: Duration,
        pub polling_interval: Duration,
    }

    impl Default for BindingPolicy {
        fn default() -> Self {
            Self::from(&BindingConfig::default())
        }
    }

    impl From<&BindingConfig> for BindingPolicy {
        fn from(c: &BindingConfig) -> Self {
            Self {
                max_attempts: c.max_attempts.max(1),
                backoff_step: Duration::from_millis(c.backoff_step_ms),
                slow_cycle: Duration::from_millis(c.slow_cycle_ms),
                polling_grace: Duration::from_millis(c.polling_grace_ms),
                polling_interval: Duration::from_millis(c.polling_interval_ms),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BindingState {
        Unbound,
        Detecting { attempt: u32 },
        Bound(Strategy),
        Retrying { attempt: u32 },
        Polling { attempt: u32 },
    }

    #[derive(Debug)]
    pub enum BindOutcome {
        Bound {
            strategy: Strategy,
            subscription: Subscription,
        },
        Retry {
            after: Duration,
            /// 本次失败后首次进入轮询
            start_polling: bool,
        },
    }

    pub struct EventBinder {
        locators: Vec<Box<dyn EventSourceLocator>>,
        policy: BindingPolicy,
        state: BindingState,
        attempts: u32,
        polling: bool,
    }

    impl EventBinder {
        pub fn new(mut locators: Vec<Box<dyn EventSourceLocator>>, policy: BindingPolicy) -> Self {
            locators.sort_by_key(|p| p.strategy());
            Self {
                locators,
                policy,
                state: BindingState::Unbound,
                attempts: 0,
                polling: false,
            }
        }

        pub fn state(&self) -> BindingState {
            self.state
        }

        pub fn policy(&self) -> &BindingPolicy {
            &self.policy
        }

        pub fn is_bound(&self) -> bool {
            matches!(self.state, BindingState::Bound(_))
        }

        pub fn is_polling(&self) -> bool {
            self.polling
        }

        /// 任一探测方式当前能找到事件系统 (不订阅)
        pub fn source_available(&self) -> bool {
            self.locators.iter().any(|p| p.detect().is_some())
        }

        /// 宽限期到期时调用：仍未绑定则进入轮询，返回是否新开启
        pub fn begin_polling(&mut self) -> bool {
            if self.polling || self.is_bound() {
                return false;
            }
            log::warn!("[事件绑定] 事件系统长时间不可用，启用轮询兜底");
            self.polling = true;
            self.state = BindingState::Polling {
                attempt: self.attempts,
            };
            true
        }

        /// 按优先级依次探测，第一个订阅成功的方式胜出
        pub fn try_bind(&mut self, tx: &UnboundedSender<HostEvent>, elapsed: Duration) -> BindOutcome {
            self.state = BindingState::Detecting {
                attempt: self.attempts + 1,
            };

            for locator in &self.locators {
                let strategy = locator.strategy();
                let Some(source) = locator.detect() else {
                    continue;
                };
                match source.on_message_received(tx.clone()) {
                    Ok(subscription) => {
                        log::info!("[事件绑定] 已通过{}绑定消息事件", strategy.label());
                        self.state = BindingState::Bound(strategy);
                        self.attempts = 0;
                        self.polling = false;
                        return BindOutcome::Bound {
                            strategy,
                            subscription,
                        };
                    }
                    Err(e) => {
                        log::warn!("[事件绑定] {}订阅失败: {}", strategy.label(), e);
                    }
                }
            }

            self.on_failure(elapsed)
        }

        fn on_failure(&mut self, elapsed: Duration) -> BindOutcome {
            self.attempts += 1;
            let attempt = self.attempts;

            let after = if attempt >= self.policy.max_attempts {
                log::warn!(
                    "[事件绑定] 连续 {} 次未找到事件系统，{} 秒后再试",
                    attempt,
                    self.policy.slow_cycle.as_secs()
                );
                self.attempts = 0;
                self.policy.slow_cycle
            } else {
                log::debug!("[事件绑定] 第 {} 次尝试失败", attempt);
                self.policy.backoff_step * attempt
            };

            let start_polling = !self.polling && elapsed >= self.policy.polling_grace;
            if start_polling {
                log::warn!("[事件绑定] 事件系统长时间不可用，启用轮询兜底");
                self.polling = true;
            }

            self.state = if self.polling {
                BindingState::Polling { attempt }
            } else {
                BindingState::Retrying { attempt }
            };

            BindOutcome::Retry {
                after,
                start_polling,
            }
        }
    }

}

// --- 渲染调度 ---
pub mod reconcile {
    // 每个“有变化”的信号都走同一套判定：冷却 → 消息数 → 群聊优先 → 增量或全量。
    // 这里只做决定，不碰视图；执行在 app 中完成。

    use crate::config::Config;
    use crate::token::has_group_chat_token;
    use crate::types::ChatMessage;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum View {
        #[default]
        List,
        AddFriend,
        MessageDetail,
        FriendsCircle,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum UserAction {
        /// 用户刚发出消息
        Send,
        Delete,
        SwitchTab(View),
        Refresh,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Trigger {
        HostMessage { message_id: u64 },
        PollTick,
        /// 发送后兜底刷新的定时器到期
        DelayedRender,
        User(UserAction),
    }

    impl Trigger {
        /// 强制刷新不受冷却和消息数限制
        pub fn is_forced(&self) -> bool {
            matches!(
                self,
                Trigger::DelayedRender
                    | Trigger::User(UserAction::Delete | UserAction::SwitchTab(_) | UserAction::Refresh)
            )
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SkipReason {
        Cooldown,
        NoNewMessages,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RenderDecision {
        Skip(SkipReason),
        /// 清空容器重建，并重新绑定事件
        Full { view: View, group_burst: bool },
        /// 交给增量渲染器，再轻量更新时间和未读角标
        Incremental,
        /// (重新) 安排一次延迟刷新，旧定时器作废
        ScheduleDelayed(Duration),
    }

    impl RenderDecision {
        pub fn renders(&self) -> bool {
            matches!(self, RenderDecision::Full { .. } | RenderDecision::Incremental)
        }
    }

    #[derive(Debug, Clone)]
    pub struct Reconciler {
        current_view: View,
        use_incremental: bool,
        incremental_available: bool,
        last_render_time: Option<Instant>,
        render_cooldown: Duration,
        last_message_count: usize,
        base_cooldown: Duration,
        incremental_cooldown: Duration,
        group_burst_cooldown: Duration,
        delayed_render: Duration,
        group_scan_depth: usize,
    }

    impl Reconciler {
        pub fn new(config: &Config) -> Self {
            let mut r = Self {
                current_view: View::List,
                use_incremental: false,
                incremental_available: false,
                last_render_time: None,
                render_cooldown: config.render_cooldown(),
                last_message_count: 0,
                base_cooldown: config.render_cooldown(),
                incremental_cooldown: config.incremental_cooldown(),
                group_burst_cooldown: config.group_burst_cooldown(),
                delayed_render: config.delayed_render(),
                group_scan_depth: config.group_scan_depth,
            };
            r.set_incremental(config.use_incremental_render);
            r
        }

        pub fn current_view(&self) -> View {
            self.current_view
        }

        pub fn render_cooldown(&self) -> Duration {
            self.render_cooldown
        }

        pub fn last_message_count(&self) -> usize {
            self.last_message_count
        }

        pub fn last_render_time(&self) -> Option<Instant> {
            self.last_render_time
        }

        pub fn is_incremental(&self) -> bool {
            self.use_incremental
        }

        /// 增量模式冷却时间提高到 3 秒
        pub fn set_incremental(&mut self, enabled: bool) {
            self.use_incremental = enabled;
            self.render_cooldown = self.steady_cooldown();
        }

        pub fn set_incremental_available(&mut self, available: bool) {
            self.incremental_available = available;
        }

        fn steady_cooldown(&self) -> Duration {
            if self.use_incremental {
                self.incremental_cooldown
            } else {
                self.base_cooldown
            }
        }

        fn is_group_burst(&self, messages: &[ChatMessage]) -> bool {
            let start = messages.len().saturating_sub(self.group_scan_depth);
            messages[start..]
                .iter()
                .any(|m| has_group_chat_token(&m.text))
        }

        pub fn decide(
            &mut self,
            trigger: Trigger,
            messages: &[ChatMessage],
            now: Instant,
        ) -> RenderDecision {
            match trigger {
                Trigger::User(UserAction::Send) => {
                    return RenderDecision::ScheduleDelayed(self.delayed_render);
                }
                Trigger::User(UserAction::SwitchTab(view)) => self.current_view = view,
                _ => {}
            }

            let count = messages.len();

            if trigger.is_forced() {
                self.last_message_count = count;
                self.render_cooldown = self.steady_cooldown();
                self.last_render_time = Some(now);
                return RenderDecision::Full {
                    view: self.current_view,
                    group_burst: false,
                };
            }

            if let Some(last) = self.last_render_time
                && now.saturating_duration_since(last) < self.render_cooldown
            {
                return RenderDecision::Skip(SkipReason::Cooldown);
            }

            if count <= self.last_message_count {
                return RenderDecision::Skip(SkipReason::NoNewMessages);
            }
            self.last_message_count = count;
            self.last_render_time = Some(now);

            if self.is_group_burst(messages) {
                // 群聊正确性优先：同步全量，并缩短冷却以便紧接着的更新
                self.render_cooldown = self.group_burst_cooldown;
                return RenderDecision::Full {
                    view: self.current_view,
                    group_burst: true,
                };
            }

            self.render_cooldown = self.steady_cooldown();
            if self.use_incremental && self.incremental_available {
                RenderDecision::Incremental
            } else {
                RenderDecision::Full {
                    view: self.current_view,
                    group_burst: false,
                }
            }
        }
    }

}

// --- 消息列表渲染 ---
pub mod render {
    use crate::reconcile::View;
    use crate::types::{ChatMessage, Contact, ExtractionResult};
    use crate::utils::format_time;
    use chrono::{DateTime, Local};
    use html_escape::{encode_double_quoted_attribute, encode_text};
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 视图渲染器。每次全量渲染都会替换容器内容，实现方不得跨渲染缓存节点引用。
    pub trait ViewRenderer: Send + Sync {
        /// 清空并重建视图，随后重新绑定事件
        fn render_full(&self, view: View, contacts: &ExtractionResult) -> anyhow::Result<()>;

        /// 只更新时间和未读角标
        fn touch_up(&self, contacts: &ExtractionResult) -> anyhow::Result<()>;
    }

    /// 增量渲染组件 (只追加新气泡)
    pub trait IncrementalRenderer: Send + Sync {
        fn apply(&self, messages: &[ChatMessage]) -> anyhow::Result<()>;
    }

    const LIST_CSS: &str = r#"
 .contact-group{border-bottom:0.5px solid #eee;margin-top:5px}
 .contact-group-header{padding:8px 16px;background:#fdf5e6;display:flex;justify-content:space-between;align-items:center;cursor:pointer;list-style:none}
 .group-title{font-size:11px;font-weight:900;color:#8b4513;display:flex;align-items:center;gap:6px}
 .group-count{background:#8b4513;color:white;font-size:9px;padding:1px 5px;border-radius:10px;opacity:0.6}
 .contact-group-body{background:#fff}
 .unread-dot{color:#ff3b30;font-size:10px;margin-left:4px}
 .message-time{font-size:10px;color:#bbb;min-width:30px;text-align:right}
"#;

    const EMPTY_STATE: &str = r#"<div class="empty-state"><div class="empty-icon">💬</div><div class="empty-text">暂无联系人</div></div>"#;

    fn render_item(c: &Contact, now: DateTime<Local>) -> String {
        let preview = if c.last_message_preview.is_empty() {
            "暂无消息"
        } else {
            c.last_message_preview.as_str()
        };
        let time = match c.last_message_time {
            Some(_) => format_time(c.last_message_time, now),
            None => String::new(),
        };
        let (class, avatar) = if c.is_group() {
            ("group-item", r#"<div class="message-avatar group-avatar"></div>"#)
        } else {
            ("friend-item", r#"<div class="message-avatar"></div>"#)
        };
        let badge = if c.is_group() {
            r#"<span class="group-badge">群聊</span>"#
        } else {
            ""
        };
        let unread = if c.has_unread {
            r#"<span class="unread-dot">●</span>"#
        } else {
            ""
        };

        format!(
            r#"<div class="message-item {class}" data-friend-id="{id}" data-is-group="{is_group}">{avatar}<div class="message-content"><div class="message-name">{name}{badge}{unread}</div><div class="message-text">{preview}</div></div><div class="message-time">{time}</div></div>"#,
            id = encode_double_quoted_attribute(&c.number),
            is_group = c.is_group(),
            name = encode_text(&c.display_name),
            preview = encode_text(preview),
        )
    }

    fn render_section(title: &str, icon: &str, list: &[&Contact], now: DateTime<Local>) -> String {
        if list.is_empty() {
            return String::new();
        }
        let body: String = list.iter().map(|c| render_item(c, now)).collect();
        format!(
            r#"<details class="contact-group"><summary class="contact-group-header"><div class="group-title"><span>{icon} {title}</span> <span class="group-count">{count}</span></div></summary><div class="contact-group-body">{body}</div></details>"#,
            count = list.len(),
        )
    }

    /// 联系人列表 HTML。按 `group_type` 分组：special 与未分组的在顶部，
    /// colleague / client 各自折叠。
    pub fn render_friends_html(contacts: &ExtractionResult, now: DateTime<Local>) -> String {
        if contacts.is_empty() {
            return EMPTY_STATE.to_string();
        }

        let mut special = Vec::new();
        let mut colleague = Vec::new();
        let mut client = Vec::new();
        let mut others = Vec::new();
        for c in contacts {
            match c.group_type.as_deref() {
                Some("special") => special.push(c),
                Some("colleague") => colleague.push(c),
                Some("client") => client.push(c),
                _ => others.push(c),
            }
        }

        let top: String = special
            .iter()
            .chain(others.iter())
            .map(|c| render_item(c, now))
            .collect();
        let colleague = render_section("律所权力金字塔", "⚖️", &colleague, now);
        let client = render_section("客户与项目合作", "💎", &client, now);

        format!(r#"<style>{LIST_CSS}</style><div class="special-list">{top}</div>{colleague}{client}"#)
    }

    /// 列表项上可被轻量更新的部分
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Badge {
        pub number: String,
        pub time: String,
        pub unread: bool,
    }

    /// 把列表渲染成字符串保存在内存中，供宿主适配层取用
    #[derive(Debug, Default)]
    pub struct HtmlListRenderer {
        html: RwLock<String>,
        badges: RwLock<Vec<Badge>>,
        full_renders: AtomicUsize,
    }

    impl HtmlListRenderer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn html(&self) -> String {
            self.html.read().map(|h| h.clone()).unwrap_or_default()
        }

        pub fn badges(&self) -> Vec<Badge> {
            self.badges.read().map(|b| b.clone()).unwrap_or_default()
        }

        pub fn full_renders(&self) -> usize {
            self.full_renders.load(Ordering::SeqCst)
        }
    }

    impl ViewRenderer for HtmlListRenderer {
        fn render_full(&self, view: View, contacts: &ExtractionResult) -> anyhow::Result<()> {
            if view != View::List {
                log::debug!("[消息应用] {:?} 视图不由列表渲染器处理", view);
                return Ok(());
            }
            let html = render_friends_html(contacts, Local::now());
            *self
                .html
                .write()
                .map_err(|_| anyhow::anyhow!("列表缓存锁已损坏"))? = html;
            self.full_renders.fetch_add(1, Ordering::SeqCst);
            self.touch_up(contacts)
        }

        fn touch_up(&self, contacts: &ExtractionResult) -> anyhow::Result<()> {
            let now = Local::now();
            let badges = contacts
                .iter()
                .map(|c| Badge {
                    number: c.number.clone(),
                    time: match c.last_message_time {
                        Some(_) => format_time(c.last_message_time, now),
                        None => String::new(),
                    },
                    unread: c.has_unread,
                })
                .collect();
            *self
                .badges
                .write()
                .map_err(|_| anyhow::anyhow!("角标缓存锁已损坏"))? = badges;
            Ok(())
        }
    }

}

// --- 应用入口 ---
pub mod app {
    // PhoneApp 持有全部状态，由 Driver 在 tokio 上驱动：
    // 宿主事件、绑定重试、轮询兜底、发送后的延迟刷新、用户操作，都汇入同一个 select 循环。

    use crate::binding::{BindOutcome, EventBinder};
    use crate::config::Config;
    use crate::error::PhoneError;
    use crate::extract::{Extractor, last_chat_record};
    use crate::host::{ChatHost, HostEvent, Notifier, Subscription, ToastLevel, TranscriptWriter};
    use crate::reconcile::{Reconciler, RenderDecision, Trigger, UserAction};
    use crate::removal::strip_contact_tokens;
    use crate::render::{IncrementalRenderer, ViewRenderer, render_friends_html};
    use crate::types::{ChatMessage, Contact, ExtractionResult};
    use crate::weight::{ReadStateStore, WeightTracker};
    use chrono::Local;
    use log::{debug, error, info, warn};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{Mutex, mpsc};
    use tokio::time::{Instant, Interval, MissedTickBehavior};

    /// 宿主侧的各项能力
    pub struct AppParts {
        pub host: Arc<dyn ChatHost>,
        /// 宿主不支持改写消息时为 None，删除联系人会直接报错
        pub writer: Option<Arc<dyn TranscriptWriter>>,
        pub view: Arc<dyn ViewRenderer>,
        pub incremental: Option<Arc<dyn IncrementalRenderer>>,
        pub store: Arc<dyn ReadStateStore>,
        pub notifier: Arc<dyn Notifier>,
    }

    /// 删除联系人的结果，失败的消息不会回滚已完成的修改
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct DeleteReport {
        pub modified: Vec<usize>,
        pub failed: Vec<usize>,
    }

    pub struct PhoneApp {
        config: Config,
        extractor: Extractor,
        weights: WeightTracker,
        reconciler: Reconciler,
        contacts: ExtractionResult,
        last_contact_count: Option<usize>,
        parts: AppParts,
    }

    impl PhoneApp {
        pub fn new(config: Config, parts: AppParts) -> Self {
            let mut reconciler = Reconciler::new(&config);
            reconciler.set_incremental_available(parts.incremental.is_some());
            Self {
                extractor: Extractor::new(config.preview_max_chars),
                weights: WeightTracker::new(config.peer_weight_bias),
                reconciler,
                contacts: ExtractionResult::default(),
                last_contact_count: None,
                parts,
                config,
            }
        }

        pub fn config(&self) -> &Config {
            &self.config
        }

        pub fn reconciler(&self) -> &Reconciler {
            &self.reconciler
        }

        /// 上一次提取的结果 (不重新读取宿主)
        pub fn contacts(&self) -> &ExtractionResult {
            &self.contacts
        }

        fn read_messages(&self) -> Option<Vec<ChatMessage>> {
            if !self.parts.host.is_ready() {
                warn!("[好友渲染器] 宿主尚未就绪");
                return None;
            }
            match self.parts.host.messages() {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("[好友渲染器] {}", PhoneError::ExtractionFailed(e.to_string()));
                    None
                }
            }
        }

        fn rebuild(&mut self, messages: &[ChatMessage]) {
            let mut result = self.extractor.extract(messages);
            self.weights.scan(messages);
            self.weights
                .apply_unread(&mut result.contacts, self.parts.store.as_ref());

            let count = result.len();
            if self.last_contact_count != Some(count) {
                info!("[好友渲染器] 从上下文中提取到 {} 个联系人 (好友+群聊)", count);
                self.last_contact_count = Some(count);
            }
            self.contacts = result;
        }

        /// 重新读取聊天记录并提取联系人，宿主不可用时得到空列表
        pub fn extract_friends_from_context(&mut self) -> &ExtractionResult {
            match self.read_messages() {
                Some(messages) => self.rebuild(&messages),
                None => self.contacts = ExtractionResult::default(),
            }
            &self.contacts
        }

        pub fn render_friends_html(&mut self) -> String {
            self.extract_friends_from_context();
            render_friends_html(&self.display_order(), Local::now())
        }

        pub fn refresh(&mut self) {
            self.extract_friends_from_context();
            info!("[好友渲染器] 好友列表已刷新");
        }

        /// 按好友号/群号查找
        pub fn get_friend_by_id(&self, number: &str) -> Option<&Contact> {
            self.contacts.get_by_number(number)
        }

        pub fn friend_count(&self) -> usize {
            self.contacts.len()
        }

        pub fn last_chat_record(&self) -> String {
            let messages = self.read_messages().unwrap_or_default();
            last_chat_record(&messages, self.config.preview_max_chars)
        }

        pub fn mark_read(&mut self, number: &str) -> anyhow::Result<()> {
            self.weights
                .mark_read(number, self.parts.store.as_ref())
                .map_err(|e| PhoneError::Store(e.to_string()))?;
            for c in self.contacts.contacts.iter_mut().filter(|c| c.number == number) {
                c.has_unread = false;
            }
            Ok(())
        }

        /// 列表显示顺序：最近有消息往来的在前
        fn display_order(&self) -> ExtractionResult {
            let mut ordered = self.contacts.clone();
            self.weights.sort_by_weight(&mut ordered.contacts);
            ordered
        }

        /// 删除联系人：逐条改写含其标记的消息，思考块不动。
        /// 单条写回失败只提示，不影响其余消息。
        pub fn delete_contact(&mut self, contact_id: &str) -> anyhow::Result<DeleteReport> {
            let writer = self
                .parts
                .writer
                .clone()
                .ok_or_else(|| PhoneError::HostNotReady("宿主不支持修改消息".into()))?;
            let messages = self
                .read_messages()
                .ok_or_else(|| PhoneError::HostNotReady("聊天数据不可用".into()))?;

            let contact = match self.contacts.get_by_id(contact_id) {
                Some(c) => c.clone(),
                None => {
                    self.rebuild(&messages);
                    self.contacts
                        .get_by_id(contact_id)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("联系人 {} 不存在", contact_id))?
                }
            };

            let mut report = DeleteReport::default();
            for (index, message) in messages.iter().enumerate() {
                let Some(text) = strip_contact_tokens(&message.text, &contact) else {
                    continue;
                };
                match writer.set_message_text(index, &text) {
                    Ok(()) => report.modified.push(index),
                    Err(e) => {
                        let err = PhoneError::WriteBack {
                            index,
                            reason: e.to_string(),
                        };
                        error!("[消息应用] {}", err);
                        self.parts.notifier.toast(ToastLevel::Error, &err.to_string());
                        report.failed.push(index);
                    }
                }
            }

            if report.failed.is_empty() {
                self.parts.notifier.toast(
                    ToastLevel::Success,
                    &format!("已删除 {}", contact.display_name),
                );
            } else {
                self.parts.notifier.toast(
                    ToastLevel::Warning,
                    &format!(
                        "{} 部分消息未能修改 ({} 条)",
                        contact.display_name,
                        report.failed.len()
                    ),
                );
            }
            info!(
                "[消息应用] 删除 {}：修改 {} 条，失败 {} 条",
                contact.id,
                report.modified.len(),
                report.failed.len()
            );

            self.extract_friends_from_context();
            Ok(report)
        }

        /// 处理一个信号：先做决定，需要渲染时读取当前快照并执行。渲染失败只记日志。
        pub fn handle(&mut self, trigger: Trigger, now: Instant) -> RenderDecision {
            let messages = self.read_messages().unwrap_or_default();
            let decision = self.reconciler.decide(trigger, &messages, now);

            match decision {
                RenderDecision::Full { view, group_burst } => {
                    if group_burst {
                        debug!("[消息应用] 检测到群聊消息，全量刷新");
                    }
                    self.rebuild(&messages);
                    if let Err(e) = self.parts.view.render_full(view, &self.display_order()) {
                        error!("[消息应用] 渲染失败: {}", e);
                    }
                }
                RenderDecision::Incremental => {
                    self.rebuild(&messages);
                    if let Some(inc) = &self.parts.incremental
                        && let Err(e) = inc.apply(&messages)
                    {
                        error!("[消息应用] 增量渲染失败: {}", e);
                    }
                    if let Err(e) = self.parts.view.touch_up(&self.display_order()) {
                        error!("[消息应用] 更新列表失败: {}", e);
                    }
                }
                RenderDecision::Skip(reason) => debug!("[消息应用] 跳过渲染: {:?}", reason),
                RenderDecision::ScheduleDelayed(_) => {}
            }

            decision
        }
    }

    // --- 驱动 ---

    /// 供界面层使用的句柄，全部句柄 drop 后 Driver 退出
    #[derive(Clone)]
    pub struct PhoneHandle {
        pub app: Arc<Mutex<PhoneApp>>,
        actions: mpsc::UnboundedSender<UserAction>,
    }

    impl PhoneHandle {
        /// Driver 已退出时返回 false
        pub fn send(&self, action: UserAction) -> bool {
            self.actions.send(action).is_ok()
        }
    }

    pub struct Driver {
        app: Arc<Mutex<PhoneApp>>,
        binder: EventBinder,
        actions: mpsc::UnboundedReceiver<UserAction>,
    }

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(86400 * 365)
    }

    async fn dispatch(app: &Mutex<PhoneApp>, trigger: Trigger) -> RenderDecision {
        app.lock().await.handle(trigger, Instant::now())
    }

    async fn tick(poll: &mut Option<Interval>) {
        match poll {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    impl Driver {
        pub fn new(app: PhoneApp, binder: EventBinder) -> (Self, PhoneHandle) {
            let app = Arc::new(Mutex::new(app));
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = PhoneHandle {
                app: app.clone(),
                actions: tx,
            };
            (
                Self {
                    app,
                    binder,
                    actions: rx,
                },
                handle,
            )
        }

        pub async fn run(mut self) {
            let started = Instant::now();
            let (events_tx, mut events_rx) = mpsc::unbounded_channel::<HostEvent>();
            let mut subscription: Option<Subscription> = None;
            let mut retry_at: Option<Instant> = Some(started);
            let mut poll: Option<Interval> = None;
            let mut delayed_at: Option<Instant> = None;
            let polling_interval = self.binder.policy().polling_interval;
            let grace_deadline = started + self.binder.policy().polling_grace;
            let mut grace_pending = true;
            let start_poll = || {
                let mut interval = tokio::time::interval(polling_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            };

            dispatch(&self.app, Trigger::User(UserAction::Refresh)).await;

            loop {
                let trigger = tokio::select! {
                    Some(event) = events_rx.recv() => match event {
                        HostEvent::MessageReceived(id) => Trigger::HostMessage { message_id: id },
                        HostEvent::MessageSent(_) => Trigger::User(UserAction::Send),
                        HostEvent::ChatChanged => Trigger::User(UserAction::Refresh),
                    },
                    _ = tokio::time::sleep_until(retry_at.unwrap_or_else(far_future)), if retry_at.is_some() => {
                        retry_at = None;
                        match self.binder.try_bind(&events_tx, started.elapsed()) {
                            BindOutcome::Bound { subscription: s, .. } => {
                                subscription = Some(s);
                                if poll.take().is_some() {
                                    info!("[事件绑定] 事件已恢复，停止轮询");
                                }
                            }
                            BindOutcome::Retry { after, start_polling } => {
                                retry_at = Some(Instant::now() + after);
                                if start_polling {
                                    poll = Some(start_poll());
                                }
                            }
                        }
                        continue;
                    },
                    _ = tokio::time::sleep_until(grace_deadline), if grace_pending => {
                        grace_pending = false;
                        if self.binder.begin_polling() {
                            poll = Some(start_poll());
                        }
                        continue;
                    },
                    _ = tick(&mut poll), if poll.is_some() => {
                        if !self.binder.is_bound() && self.binder.source_available() {
                            retry_at = Some(Instant::now());
                        }
                        Trigger::PollTick
                    },
                    _ = tokio::time::sleep_until(delayed_at.unwrap_or_else(far_future)), if delayed_at.is_some() => {
                        delayed_at = None;
                        Trigger::DelayedRender
                    },
                    action = self.actions.recv() => match action {
                        Some(action) => Trigger::User(action),
                        None => break,
                    },
                };

                if let RenderDecision::ScheduleDelayed(after) = dispatch(&self.app, trigger).await {
                    delayed_at = Some(Instant::now() + after);
                }
            }

            if let Some(s) = subscription {
                s.unsubscribe();
            }
            info!("[消息应用] 已停止");
        }
    }

}

// --- 导出 ---
pub use app::{AppParts, Driver, PhoneApp, PhoneHandle};
pub use config::Config;
pub use error::PhoneError;
pub use extract::{Extractor, extract};
pub use types::{ChatMessage, Contact, ContactKind, ExtractionResult};
