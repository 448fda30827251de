//! Prompt templates for the personas, the topic generator and the judge,
//! plus tolerant parsing of persona replies.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever template content changes
//! so journaled events can be traced to the prompt that produced them.

use serde_json::Value;

use crate::evaluation::{Dimension, RoundEvaluation};
use crate::persona::Persona;
use crate::planning::{parse_plan_ops, PlanOp};
use crate::policy::PromptContext;
use crate::schedule::Stage;
use crate::text::{extract_json_object, truncate_chars};

/// Prompt version. Bump on any template content change.
pub const PROMPT_VERSION: &str = "1.3.0";

/// Upper bound on the completion budget requested for a persona turn.
pub const MAX_PERSONA_TOKENS: u32 = 4096;

/// Placeholder used when the model returned nothing usable.
pub const EMPTY_REPLY_PLACEHOLDER: &str = "(无回复)";

/// How many prior topics the topic generator is shown.
const TOPIC_HISTORY_WINDOW: usize = 20;

/// Persona preamble. `{side}` and `{tag}` are filled per persona.
pub const PERSONA_PREAMBLE: &str = "\
你是一场正式辩论赛中的{side}辩手（代号 {tag}）。你与对方辩手轮流发言，\
每一轮对应赛程中的一个阶段，必须严格遵守该阶段的规则、角色和字数要求。

## 发言原则
- 立场坚定：始终站在{side}立场，不得替对方论证。
- 紧扣题目：每句话都要服务于本方论点或对对方论点的回应。
- 回应优先：对方上一轮的提问或论点必须先正面回应，再推进己方论证。
- 字数纪律：reply 不得超过给定上限，超出部分会被直接截断。
- 阶段纪律：提问环节只提问，回答环节只回答，不得越位。

## 输出格式
只输出一个严格 JSON 对象，不要输出任何多余文本：
{
  \"reply\": \"本轮发言正文\",
  \"topic\": \"\",
  \"plan_update\": [\"add: 新的备赛要点\", \"del: 需要删除的要点\", \"change: 旧要点 -> 新要点\"],
  \"experience_update\": [\"本场可以沉淀的经验\"]
}
- topic 通常留空；只有在题目待定时才可以提出题目。
- plan_update 用于维护你的备赛计划，可为空数组。
- experience_update 仅在总结陈词阶段填写，其余阶段留空数组。";

/// Topic generator system prompt.
pub const TOPIC_SYSTEM: &str = "\
你是一个辩论题目生成助手。分析给定的对话内容，找出核心分歧点，并基于此生成一个新的辩论题目。\
要求：1）题目必须可辩论，不能是事实陈述；2）题目不能与历史题目相同；3）题目应该引发对立观点；\
4）题目简洁明确，10-30字。\
输出严格JSON格式：{\"disagreement\":\"核心分歧点\",\"new_topic\":\"新辩论题目\"}";

/// Round judge system prompt.
pub const ROUND_JUDGE_SYSTEM: &str = "\
你是一位专业辩论评委，具有丰富的辩论赛事经验。你需要客观、公正、中立地评估双方的表现。

评估维度（每项1-10分，10分为满分）：
1. 论点逻辑性（logic）：论点是否清晰、逻辑严密、论证链条完整
2. 证据充分性（evidence）：是否有充分的事实、数据、理论支撑
3. 反应敏锐度（responsiveness）：是否有效回应对方观点，是否抓住对方漏洞
4. 语言表达（expression）：表达是否清晰流畅、有感染力、符合规范
5. 规则遵守（rule_compliance）：是否符合阶段规则（如提问只提问，回答只回答）

评分标准：
- 9-10分：优秀，表现突出，无明显瑕疵
- 7-8分：良好，整体表现不错，有小瑕疵
- 5-6分：一般，表现中规中矩，有明显不足
- 3-4分：较差，存在较多问题
- 1-2分：极差，严重违反规则或完全不合格

你还需要：
1. 判定本轮胜方（P1/P2/tie）
2. 指出双方的关键亮点（每方最多3条）
3. 给出改进建议（每方最多3条）
4. 用一句话概括本轮的核心交锋点（core_conflict）

输出严格JSON格式，不要包含任何其他文本。";

/// Whole-debate judge system prompt.
pub const FINAL_JUDGE_SYSTEM: &str = "\
你是一位资深辩论总评委，具有多年国际辩论赛事裁判经验。你需要对整场辩论进行综合评估，判定胜负并给出详细分析。

你的任务：
1. 判定整场辩论的胜负（正方P1 / 反方P2 / 平局tie）
2. 识别关键转折点（辩论局势发生重大变化的时刻）
3. 分析决定性因素（导致胜负的关键因素，最多3个）
4. 总结双方优点（每方最多5条）
5. 指出双方不足（每方最多5条）
6. 给出最终综合评分（每方总分100分）

评分标准：
- 90-100分：表现卓越，具有压倒性优势
- 80-89分：表现优秀，有明显优势
- 70-79分：表现良好，略有优势
- 60-69分：表现一般，势均力敌
- 50-59分：表现较差，处于劣势
- 0-49分：表现极差，全面落后

输出严格JSON格式。";

const ROUND_JUDGE_SCHEMA: &str = r#"{
  "scores": {
    "P1": {"logic": 0, "evidence": 0, "responsiveness": 0, "expression": 0, "rule_compliance": 0},
    "P2": {"logic": 0, "evidence": 0, "responsiveness": 0, "expression": 0, "rule_compliance": 0}
  },
  "round_winner": "P1/P2/tie",
  "highlights": {"P1": ["亮点1"], "P2": ["亮点1"]},
  "suggestions": {"P1": ["建议1"], "P2": ["建议1"]},
  "core_conflict": "本轮核心交锋点"
}"#;

const FINAL_JUDGE_SCHEMA: &str = r#"{
  "winner": "P1/P2/tie",
  "key_turning_points": [{"round": 1, "description": "转折点描述"}],
  "decisive_factors": ["因素1", "因素2", "因素3"],
  "strengths": {"P1": ["优点1"], "P2": ["优点1"]},
  "weaknesses": {"P1": ["不足1"], "P2": ["不足1"]},
  "final_scores": {"P1": 0, "P2": 0},
  "overall_comment": "对整场辩论的整体评价（2-3句话）"
}"#;

/// Where a persona speaks within the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerPosition {
    First,
    Second,
}

impl SpeakerPosition {
    fn label(self) -> &'static str {
        match self {
            Self::First => "先发言",
            Self::Second => "后发言",
        }
    }
}

/// Everything a persona prompt is rendered from.
#[derive(Debug, Clone)]
pub struct PersonaPromptInput<'a> {
    pub persona: Persona,
    pub round: u64,
    pub session_id: u64,
    /// 1-based position of the stage in the schedule.
    pub stage_number: usize,
    pub stage_total: usize,
    pub stage: &'a Stage,
    pub position: SpeakerPosition,
    pub topic: &'a str,
    pub max_chars: u32,
    pub plan: &'a str,
    pub experience: &'a str,
    pub conversation: &'a str,
    pub last_evaluation: Option<&'a RoundEvaluation>,
    pub policy: Option<&'a PromptContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

fn or_placeholder<'a>(text: &'a str, placeholder: &'a str) -> &'a str {
    if text.trim().is_empty() {
        placeholder
    } else {
        text.trim()
    }
}

fn render_last_evaluation(persona: Persona, eval: &RoundEvaluation) -> String {
    let mine = &eval.scores[persona];
    let dims: Vec<String> = Dimension::ALL
        .iter()
        .map(|d| format!("{} {:.1}", d.label(), mine.get(*d)))
        .collect();
    let mut out = format!(
        "你的上轮平均分 {:.2}，对方 {:.2}，上轮胜方：{}\n你的各项得分：{}",
        eval.averages[persona],
        eval.averages[persona.opponent()],
        eval.winner,
        dims.join("，")
    );
    if !eval.suggestions[persona].is_empty() {
        out.push_str(&format!("\n评委建议：{}", eval.suggestions[persona].join("；")));
    }
    if !eval.core_conflict.is_empty() {
        out.push_str(&format!("\n核心交锋：{}", eval.core_conflict));
    }
    out
}

fn render_policy(ctx: &PromptContext) -> String {
    let mut lines = Vec::new();
    if !ctx.tactics.is_empty() {
        lines.push("本轮建议战术：".to_string());
        for t in &ctx.tactics {
            lines.push(format!("- {}：{}", t.label, t.description));
        }
    }
    if !ctx.focus.is_empty() {
        let focus: Vec<String> = ctx
            .focus
            .iter()
            .map(|(d, w)| format!("{}({w:.2})", d.label()))
            .collect();
        lines.push(format!("重点提升维度：{}", focus.join("、")));
    }
    if !ctx.opponent_weaknesses.is_empty() {
        lines.push(format!("对方薄弱环节：{}", ctx.opponent_weaknesses.join("、")));
    }
    lines.join("\n")
}

/// Render the system and user prompts for one persona turn.
pub fn build_persona_prompts(input: &PersonaPromptInput<'_>) -> PromptPair {
    let persona = input.persona;
    let stage = input.stage;
    let system = PERSONA_PREAMBLE
        .replace("{side}", persona.side())
        .replace("{tag}", persona.tag());

    let mut user = format!(
        "【赛程】第 {} 场辩论，第 {}/{} 阶段（总第 {} 轮）\n\
         【阶段】{}（{}）\n\
         【规则】{}\n\
         【你的角色】{}\n\
         【你的任务】{}\n\
         【发言顺序】{}\n\
         【字数要求】{}，上限 {} 字\n\
         【辩题】{}\n",
        input.session_id,
        input.stage_number,
        input.stage_total,
        input.round,
        stage.title,
        stage.key,
        stage.rule,
        stage.roles[persona],
        stage.tasks[persona],
        input.position.label(),
        stage.length_guide[persona],
        input.max_chars,
        or_placeholder(input.topic, "(待定)"),
    );

    user.push_str(&format!(
        "\n【你的备赛计划】\n{}\n",
        or_placeholder(input.plan, "(暂无)")
    ));
    if !input.experience.trim().is_empty() {
        user.push_str(&format!("\n【历史经验】\n{}\n", input.experience.trim()));
    }
    if let Some(eval) = input.last_evaluation {
        user.push_str(&format!(
            "\n【上轮评委反馈】\n{}\n",
            render_last_evaluation(persona, eval)
        ));
    }
    if let Some(ctx) = input.policy {
        let rendered = render_policy(ctx);
        if !rendered.is_empty() {
            user.push_str(&format!("\n【策略提示】\n{rendered}\n"));
        }
    }
    user.push_str(&format!(
        "\n【对话记录（最近部分）】\n{}\n",
        or_placeholder(input.conversation, "(尚无对话)")
    ));
    if stage.is_closing() {
        user.push_str("\n这是本场最后一个阶段，请在 experience_update 中写下本场可复用的经验。\n");
    }
    user.push_str("\n现在请输出本轮 JSON。");

    PromptPair { system, user }
}

/// Completion budget for a reply of at most `max_chars` characters.
pub fn max_tokens_for(max_chars: u32) -> u32 {
    max_chars
        .saturating_mul(2)
        .saturating_add(256)
        .min(MAX_PERSONA_TOKENS)
}

/// Parsed persona output. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaTurnResult {
    pub persona: Persona,
    pub reply: String,
    pub proposed_topic: Option<String>,
    pub plan_ops: Vec<PlanOp>,
    pub experience_notes: Vec<String>,
    /// Why the reply is a placeholder, when it is one.
    pub parse_failure: Option<String>,
}

fn string_field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|n| obj.get(*n).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn looks_like_json(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with('{') || text.starts_with("```")
}

/// Parse raw persona output into a turn result.
///
/// Plain prose is taken as the reply. Output that looks like JSON but cannot
/// be parsed, or parses without a reply, gets a placeholder reply naming the
/// failure. The reply is truncated to `max_chars` characters.
pub fn parse_persona_reply(persona: Persona, raw: &str, max_chars: u32) -> PersonaTurnResult {
    let text = raw.trim();
    let mut result = PersonaTurnResult {
        persona,
        reply: String::new(),
        proposed_topic: None,
        plan_ops: Vec::new(),
        experience_notes: Vec::new(),
        parse_failure: None,
    };

    if text.is_empty() {
        result.reply = EMPTY_REPLY_PLACEHOLDER.to_string();
        result.parse_failure = Some("empty output".to_string());
        return result;
    }

    match extract_json_object(text) {
        Some(obj) => {
            result.proposed_topic = string_field(&obj, &["topic"]).map(str::to_string);
            let plan = ["plan_update", "planUpdate", "identity_update"]
                .iter()
                .find_map(|k| obj.get(*k));
            result.plan_ops = plan.map(parse_plan_ops).unwrap_or_default();
            result.experience_notes = string_list(
                obj.get("experience_update")
                    .or_else(|| obj.get("experienceUpdate")),
            );
            match string_field(&obj, &["reply", "response"]) {
                Some(reply) => result.reply = reply.to_string(),
                None => {
                    result.reply = "(回复解析失败：JSON 中缺少 reply 字段)".to_string();
                    result.parse_failure = Some("missing reply field".to_string());
                }
            }
        }
        None if looks_like_json(text) => {
            result.reply = "(回复解析失败：模型输出不是有效 JSON)".to_string();
            result.parse_failure = Some("unparseable JSON".to_string());
        }
        None => result.reply = text.to_string(),
    }

    if max_chars > 0 {
        result.reply = truncate_chars(&result.reply, max_chars as usize);
    }
    result
}

/// Render the topic generator's user prompt.
pub fn build_topic_prompt(
    round: u64,
    current_topic: &str,
    history: &[String],
    conversation: &str,
) -> PromptPair {
    let start = history.len().saturating_sub(TOPIC_HISTORY_WINDOW);
    let recent = &history[start..];
    let user = format!(
        "当前轮次：{round}\n当前题目：{}\n历史题目：{}\n\n【对话内容】\n{}",
        or_placeholder(current_topic, "无"),
        if recent.is_empty() {
            "无".to_string()
        } else {
            recent.join("；")
        },
        conversation.trim()
    );
    PromptPair {
        system: TOPIC_SYSTEM.to_string(),
        user,
    }
}

/// Pull the generated topic out of the generator's output.
pub fn parse_topic(raw: &str) -> Option<String> {
    let obj = extract_json_object(raw)?;
    string_field(&obj, &["new_topic", "topic"])
        .map(|t| t.trim_matches(['"', '“', '”', '「', '」']).trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Render the round judge's user prompt.
pub fn build_round_judge_prompt(
    round: u64,
    topic: &str,
    stage_title: &str,
    stage_key: &str,
    stage_rule: &str,
    replies: &crate::persona::PerPersona<String>,
) -> PromptPair {
    let user = format!(
        "【辩论信息】\n主题：{}\n轮次：{round}\n阶段：{stage_title} ({stage_key})\n阶段规则：{}\n\n\
         【正方P1发言】\n{}\n\n【反方P2发言】\n{}\n\n请评估双方表现并输出JSON格式：\n\n{ROUND_JUDGE_SCHEMA}",
        or_placeholder(topic, "未设定"),
        or_placeholder(stage_rule, "无特殊规则"),
        or_placeholder(&replies[Persona::P1], "(无发言)"),
        or_placeholder(&replies[Persona::P2], "(无发言)"),
    );
    PromptPair {
        system: ROUND_JUDGE_SYSTEM.to_string(),
        user,
    }
}

/// Render the whole-debate judge's user prompt.
pub fn build_final_judge_prompt(topic: &str, transcript: &str) -> PromptPair {
    let user = format!(
        "【辩论主题】\n{}\n\n【辩论历史】\n{}\n\n请进行综合评估并输出JSON格式：\n\n{FINAL_JUDGE_SCHEMA}",
        or_placeholder(topic, "未设定"),
        transcript.trim()
    );
    PromptPair {
        system: FINAL_JUDGE_SYSTEM.to_string(),
        user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::DimensionScores;
    use crate::persona::PerPersona;
    use crate::policy::tactic;
    use crate::schedule::{ScheduleConfig, StageSchedule};

    #[test]
    fn test_parse_json_reply() {
        let raw = r#"好的：{"reply":"我方认为效率优先。","topic":"新题","plan_update":["add: 举例"],"experience_update":"- 先定义\n- 后举证"}"#;
        let parsed = parse_persona_reply(Persona::P1, raw, 0);
        assert_eq!(parsed.reply, "我方认为效率优先。");
        assert_eq!(parsed.proposed_topic.as_deref(), Some("新题"));
        assert_eq!(parsed.plan_ops, vec![PlanOp::Add("举例".into())]);
        assert_eq!(parsed.experience_notes, vec!["先定义", "后举证"]);
        assert!(parsed.parse_failure.is_none());
    }

    #[test]
    fn test_plain_text_is_reply() {
        let parsed = parse_persona_reply(Persona::P2, "对方辩友的论证存在跳跃。", 5);
        assert_eq!(parsed.reply, "对方辩友的");
        assert!(parsed.parse_failure.is_none());
    }

    #[test]
    fn test_broken_json_gets_placeholder() {
        let parsed = parse_persona_reply(Persona::P2, r#"{"reply": "未闭合"#, 300);
        assert!(parsed.reply.starts_with("(回复解析失败"));
        assert!(parsed.parse_failure.is_some());

        let missing = parse_persona_reply(Persona::P1, r#"{"topic":"x"}"#, 300);
        assert!(missing.reply.contains("reply"));
        assert_eq!(missing.proposed_topic.as_deref(), Some("x"));

        let empty = parse_persona_reply(Persona::P1, "   ", 300);
        assert_eq!(empty.reply, EMPTY_REPLY_PLACEHOLDER);
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(
            parse_topic(r#"{"disagreement":"x","new_topic":"“城市应否禁摩？”"}"#).as_deref(),
            Some("城市应否禁摩？")
        );
        assert_eq!(parse_topic(r#"{"new_topic":"  "}"#), None);
        assert_eq!(parse_topic("没有 JSON"), None);
    }

    #[test]
    fn test_topic_prompt_limits_history() {
        let history: Vec<String> = (0..25).map(|i| format!("题{i}")).collect();
        let prompt = build_topic_prompt(9, "", &history, "对话");
        assert!(prompt.user.contains("当前题目：无"));
        assert!(!prompt.user.contains("题4；"));
        assert!(prompt.user.contains("题5；题6"));
    }

    #[test]
    fn test_persona_prompt_contents() {
        let schedule = StageSchedule::build(&ScheduleConfig::default());
        let stage = &schedule.stages()[0];
        let eval = RoundEvaluation::from_scores(PerPersona::new(
            DimensionScores::uniform(6.0),
            DimensionScores::uniform(8.0),
        ));
        let anchor = tactic("data_anchor").unwrap();
        let ctx = PromptContext {
            tactics: vec![anchor],
            focus: vec![(Dimension::Evidence, 1.2)],
            opponent_weaknesses: vec!["证据性".into()],
        };
        let prompts = build_persona_prompts(&PersonaPromptInput {
            persona: Persona::P2,
            round: 7,
            session_id: 2,
            stage_number: 1,
            stage_total: schedule.len(),
            stage,
            position: SpeakerPosition::Second,
            topic: "题目",
            max_chars: 900,
            plan: "",
            experience: "",
            conversation: "",
            last_evaluation: Some(&eval),
            policy: Some(&ctx),
        });
        assert!(prompts.system.contains("反方辩手（代号 P2）"));
        assert!(prompts.user.contains("上限 900 字"));
        assert!(prompts.user.contains("【辩题】题目"));
        assert!(prompts.user.contains(anchor.label));
        assert!(prompts.user.contains("你的上轮平均分 8.00"));
        assert!(prompts.user.contains("(尚无对话)"));
    }

    #[test]
    fn test_max_tokens_for() {
        assert_eq!(max_tokens_for(300), 856);
        assert_eq!(max_tokens_for(100_000), MAX_PERSONA_TOKENS);
    }

    #[test]
    fn test_judge_prompts_embed_replies() {
        let replies = PerPersona::new("甲".to_string(), String::new());
        let p = build_round_judge_prompt(3, "题", "开篇陈词", "opening", "", &replies);
        assert!(p.user.contains("【正方P1发言】\n甲"));
        assert!(p.user.contains("【反方P2发言】\n(无发言)"));
        assert!(p.user.contains("无特殊规则"));
        let f = build_final_judge_prompt("", "记录");
        assert!(f.user.contains("未设定"));
    }
}
