//! Stage schedule: the fixed multi-stage turn protocol of one debate session.
//!
//! A session runs opening statements, four cross-examination exchanges, a
//! cross-examination summary, `N` free-debate rounds and closing statements.
//! The schedule is pure data: building it has no side effects and cannot fail.

use serde::{Deserialize, Serialize};

use crate::persona::{PerPersona, Persona};

/// Characters of speech per minute used to derive length guides.
pub const CHARS_PER_MINUTE: u32 = 300;

/// Default number of free-debate rounds.
pub const DEFAULT_FREE_ROUNDS: u32 = 4;

/// Per-round ceiling for a free-debate turn without a shared budget.
pub const FREE_ROUND_MAX_CHARS: u32 = 300;

const BRAINSTORM_FLOW: &str = "头脑风暴流程：先发散列3个不同角度 → 选择1个最有冲突且可检验的角度 → 落地论点与边界 → 收束回扣对抗点。";

const ASK_TASK: &str = "提出1个尖锐问题，聚焦对方逻辑漏洞或证据缺口。";
const ANSWER_TASK: &str = "直接回答问题，给出清晰理由或证据并点明边界。";
const SUMMARY_TASK: &str = "针对攻辩态势总结己方优势与对方漏洞，不背稿，突出对抗点。";
const FREE_TASK: &str = "先回应对方最新观点，再推进己方核心论点，补充一个新角度或新证据。";
const CLOSING_TASK: &str = "最终总结，回扣核心论点与全场关键对抗点，明确胜负理由。";

/// Kind of stage, used for prompts and budget handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Opening,
    CrossExamination,
    CrossSummary,
    FreeDebate,
    Closing,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::CrossExamination => write!(f, "cross_examination"),
            Self::CrossSummary => write!(f, "cross_summary"),
            Self::FreeDebate => write!(f, "free_debate"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Suggested reply length band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthGuide {
    pub min: u32,
    pub max: u32,
    pub hint: String,
}

impl LengthGuide {
    fn new(min: u32, max: u32, hint: &str) -> Self {
        Self {
            min,
            max,
            hint: hint.to_string(),
        }
    }

    /// Band centred on `minutes` of speech with a ±`spread` character margin.
    fn for_minutes(minutes: f64, spread: u32, hint: &str) -> Self {
        let centre = calc_max_chars(minutes);
        Self::new(centre.saturating_sub(spread), centre + spread, hint)
    }
}

impl std::fmt::Display for LengthGuide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hint.is_empty() {
            write!(f, "{}-{}字", self.min, self.max)
        } else {
            write!(f, "{}-{}字（{}）", self.min, self.max, self.hint)
        }
    }
}

/// Render a length guide for prompts, e.g. `850-950字（3分钟陈词）`.
pub fn format_length_guide(guide: &LengthGuide) -> String {
    guide.to_string()
}

/// Characters for `minutes` of speech.
pub fn calc_max_chars(minutes: f64) -> u32 {
    (minutes * CHARS_PER_MINUTE as f64).round().max(0.0) as u32
}

/// One immutable stage of the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub key: String,
    pub title: String,
    pub rule: String,
    pub kind: StageKind,
    /// Persona that speaks first.
    pub first_speaker: Persona,
    pub roles: PerPersona<String>,
    pub tasks: PerPersona<String>,
    pub length_guide: PerPersona<LengthGuide>,
    pub max_chars: PerPersona<u32>,
}

impl Stage {
    /// Speaking order for this stage.
    pub fn speaker_order(&self) -> [Persona; 2] {
        [self.first_speaker, self.first_speaker.opponent()]
    }

    pub fn is_free_debate(&self) -> bool {
        self.kind == StageKind::FreeDebate
    }

    pub fn is_closing(&self) -> bool {
        self.kind == StageKind::Closing
    }

    /// Both personas' length guides, collapsed when identical.
    pub fn format_length_guides(&self) -> String {
        if self.length_guide.p1 == self.length_guide.p2 {
            return self.length_guide.p1.to_string();
        }
        format!(
            "P1: {} / P2: {}",
            self.length_guide.p1, self.length_guide.p2
        )
    }
}

/// Inputs to [`StageSchedule::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Number of free-debate rounds (an upper bound when a budget is set).
    pub free_rounds: u32,
    /// Shared per-persona character budget for free debate; 0 disables it.
    pub free_total_chars: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            free_rounds: DEFAULT_FREE_ROUNDS,
            free_total_chars: 0,
        }
    }
}

/// The ordered list of stages for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    stages: Vec<Stage>,
    free_total_chars: u32,
}

impl StageSchedule {
    pub fn build(config: &ScheduleConfig) -> Self {
        let free_rounds = config.free_rounds.max(1);
        let budget = config.free_total_chars;
        let mut stages = Vec::with_capacity(7 + free_rounds as usize);

        stages.push(Stage {
            key: "opening".into(),
            title: "陈词阶段-立论陈词".into(),
            rule: "正方一辩陈词3分钟（约900字），反方一辩陈词3分钟（约900字）。".into(),
            kind: StageKind::Opening,
            first_speaker: Persona::P1,
            roles: PerPersona::new("正方一辩".into(), "反方一辩".into()),
            tasks: PerPersona::new(
                "进行立论陈词，给出立场、定义、核心论点与证据，并说明边界条件。".into(),
                "进行立论陈词，明确反方立场并指出正方核心漏洞与隐含前提。".into(),
            ),
            length_guide: PerPersona::splat(LengthGuide::for_minutes(3.0, 50, "3分钟陈词")),
            max_chars: PerPersona::splat(calc_max_chars(3.0)),
        });

        let cross = [
            ("cross_1", Persona::P1, "二辩", "二辩/三辩"),
            ("cross_2", Persona::P2, "二辩", "二辩/三辩"),
            ("cross_3", Persona::P1, "三辩", "二辩/三辩"),
            ("cross_4", Persona::P2, "三辩", "二辩/三辩"),
        ];
        for (key, asker, asker_seat, answer_seat) in cross {
            stages.push(cross_stage(key, asker, asker_seat, answer_seat));
        }

        stages.push(Stage {
            key: "cross_summary".into(),
            title: "攻辩阶段-攻辩小结".into(),
            rule: "四轮攻辩完毕后，正方一辩与反方一辩各作2分钟攻辩小结（约600字）。".into(),
            kind: StageKind::CrossSummary,
            first_speaker: Persona::P1,
            roles: PerPersona::new("正方一辩(攻辩小结)".into(), "反方一辩(攻辩小结)".into()),
            tasks: PerPersona::splat(SUMMARY_TASK.into()),
            length_guide: PerPersona::splat(LengthGuide::for_minutes(2.0, 50, "2分钟小结")),
            max_chars: PerPersona::splat(calc_max_chars(2.0)),
        });

        let free_rule = if budget > 0 {
            format!(
                "自由辩论由正方先发言，正反方轮流发言。总字数预算：每方{budget}字（预算优先，回合数仅为上限）。{BRAINSTORM_FLOW}"
            )
        } else {
            format!(
                "自由辩论由正方先发言，正反方轮流发言，共{free_rounds}轮（回合数为上限，字数按阶段建议控制，约{FREE_ROUND_MAX_CHARS}字/轮）。{BRAINSTORM_FLOW}"
            )
        };
        let free_ceiling = if budget > 0 {
            budget.div_ceil(free_rounds)
        } else {
            FREE_ROUND_MAX_CHARS
        };
        let free_guide = if budget > 0 {
            LengthGuide::new(
                free_ceiling.saturating_sub(free_ceiling / 10),
                free_ceiling,
                "自由辩论单轮（共享预算）",
            )
        } else {
            LengthGuide::new(280, 320, "自由辩论单轮")
        };
        for i in 1..=free_rounds {
            stages.push(Stage {
                key: format!("free_{i}"),
                title: format!("自由辩论阶段-第{i}轮"),
                rule: free_rule.clone(),
                kind: StageKind::FreeDebate,
                first_speaker: Persona::P1,
                roles: PerPersona::new("正方自由辩".into(), "反方自由辩".into()),
                tasks: PerPersona::splat(FREE_TASK.into()),
                length_guide: PerPersona::splat(free_guide.clone()),
                max_chars: PerPersona::splat(free_ceiling),
            });
        }

        stages.push(Stage {
            key: "closing".into(),
            title: "总结陈词阶段".into(),
            rule: "反方四辩总结陈词3分钟（约900字）；正方四辩总结陈词3分钟（约900字）。".into(),
            kind: StageKind::Closing,
            first_speaker: Persona::P2,
            roles: PerPersona::new("正方四辩(总结陈词)".into(), "反方四辩(总结陈词)".into()),
            tasks: PerPersona::splat(CLOSING_TASK.into()),
            length_guide: PerPersona::splat(LengthGuide::for_minutes(3.0, 50, "3分钟总结")),
            max_chars: PerPersona::splat(calc_max_chars(3.0)),
        });

        Self {
            stages,
            free_total_chars: budget,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stage at `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// Index of the closing stage (always the last one).
    pub fn closing_index(&self) -> usize {
        self.stages.len().saturating_sub(1)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.key == key)
    }

    /// Shared free-debate budget, if enabled.
    pub fn free_budget(&self) -> Option<u32> {
        (self.free_total_chars > 0).then_some(self.free_total_chars)
    }

    /// Character ceiling for `persona` in `stage` given its free-debate usage.
    ///
    /// Outside free debate, or without a shared budget, this is the stage's
    /// static ceiling. With a budget it never exceeds what is left of it.
    pub fn effective_max_chars(&self, stage: &Stage, persona: Persona, used: u32) -> u32 {
        let ceiling = stage.max_chars[persona];
        match self.free_budget() {
            Some(budget) if stage.is_free_debate() => ceiling.min(budget.saturating_sub(used)),
            _ => ceiling,
        }
    }

    /// Whether `persona` has no free-debate budget left.
    pub fn persona_exhausted(&self, usage: &PerPersona<u32>, persona: Persona) -> bool {
        self.free_budget()
            .is_some_and(|budget| usage[persona] >= budget)
    }

    /// Whether both personas have spent the shared free-debate budget.
    pub fn budget_exhausted(&self, usage: &PerPersona<u32>) -> bool {
        Persona::ALL
            .iter()
            .all(|p| self.persona_exhausted(usage, *p))
    }
}

fn cross_stage(key: &str, asker: Persona, asker_seat: &str, answer_seat: &str) -> Stage {
    let answerer = asker.opponent();
    let title = format!("攻辩阶段-{}{}提问", asker.side(), asker_seat);
    let rule = format!(
        "{}{}提问，{}{}回答；提问30秒（约150字），回答1分钟（约300字）。",
        asker.side(),
        asker_seat,
        answerer.side(),
        answer_seat
    );
    let mut roles = PerPersona::splat(String::new());
    roles[asker] = format!("{}{}(提问)", asker.side(), asker_seat);
    roles[answerer] = format!("{}{}(回答)", answerer.side(), answer_seat);

    let mut tasks = PerPersona::splat(String::new());
    tasks[asker] = ASK_TASK.to_string();
    tasks[answerer] = ANSWER_TASK.to_string();

    let mut length_guide = PerPersona::splat(LengthGuide::for_minutes(0.5, 10, "提问30秒"));
    length_guide[answerer] = LengthGuide::for_minutes(1.0, 20, "回答1分钟");

    let mut max_chars = PerPersona::splat(calc_max_chars(0.5));
    max_chars[answerer] = calc_max_chars(1.0);

    Stage {
        key: key.to_string(),
        title,
        rule,
        kind: StageKind::CrossExamination,
        first_speaker: asker,
        roles,
        tasks,
        length_guide,
        max_chars,
    }
}
