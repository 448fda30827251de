//! End-to-end rounds against scripted collaborators and a temp state dir.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use std::collections::VecDeque;

use debate_engine::collaborator::{
    Judge, JudgeError, JudgeRequest, ModelClient, ModelRequest, ModelResponse, TransportError,
};
use debate_engine::evaluation::{DimensionScores, FinalEvaluation, RoundEvaluation, Winner};
use debate_engine::dynamics::ConversationalState;
use debate_engine::persistence;
use debate_engine::session::{Session, FALLBACK_TOPICS};
use debate_engine::{
    EngineConfig, PerPersona, Persona, RoundError, RoundOrchestrator, ScheduleConfig, StateLayout,
    TopicSource,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Model that answers every persona with a distinct scripted reply.
struct ScriptedModel {
    requests: Mutex<Vec<ModelRequest>>,
    fail_for: Mutex<Option<Persona>>,
    identical: bool,
}

impl ScriptedModel {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail_for: Mutex::new(None),
            identical: false,
        }
    }

    fn identical() -> Self {
        Self {
            identical: true,
            ..Self::new()
        }
    }

    fn fail_for(&self, persona: Option<Persona>) {
        *self.fail_for.lock().unwrap() = persona;
    }

    fn topic_requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.persona.is_none())
            .cloned()
            .collect()
    }

    fn persona_requests(&self, persona: Persona) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.persona == Some(persona))
            .count()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, TransportError> {
        let persona = request.persona;
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        let Some(persona) = persona else {
            return Ok(ModelResponse::text(r#"{"new_topic":"生成的新题目？"}"#));
        };
        if *self.fail_for.lock().unwrap() == Some(persona) {
            return Err(TransportError::Timeout("scripted".into()));
        }
        if self.identical {
            return Ok(ModelResponse::text(r#"{"reply":"完全相同的发言内容"}"#));
        }
        let body = match persona {
            Persona::P1 => "我方主张效率优先，数据显示成本明显下降",
            Persona::P2 => "对方忽视公平代价，弱势群体因此受损严重",
        };
        Ok(ModelResponse::text(format!(
            r#"{{"reply":"{body}（{n}）","plan_update":["add: 要点{n}"],"experience_update":["经验{n}"]}}"#
        )))
    }
}

/// Judge that scores P1 ahead, or fails when told to.
struct ScriptedJudge {
    available: Mutex<bool>,
    rounds: Mutex<Vec<u64>>,
}

impl ScriptedJudge {
    fn new() -> Self {
        Self {
            available: Mutex::new(true),
            rounds: Mutex::new(Vec::new()),
        }
    }

    fn set_available(&self, available: bool) {
        *self.available.lock().unwrap() = available;
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn evaluate_round(&self, request: JudgeRequest) -> Result<RoundEvaluation, JudgeError> {
        if !*self.available.lock().unwrap() {
            return Err(JudgeError::Transport(TransportError::Connection("down".into())));
        }
        self.rounds.lock().unwrap().push(request.round);
        Ok(RoundEvaluation::from_scores(PerPersona::new(
            DimensionScores::uniform(7.0),
            DimensionScores::uniform(6.0),
        )))
    }

    async fn evaluate_debate(
        &self,
        _topic: &str,
        _transcript: &str,
    ) -> Result<FinalEvaluation, JudgeError> {
        Ok(FinalEvaluation {
            winner: Winner::P1,
            key_turning_points: vec![],
            decisive_factors: vec!["证据".into()],
            strengths: PerPersona::default(),
            weaknesses: PerPersona::default(),
            final_scores: PerPersona::new(80.0, 70.0),
            overall_comment: "正方略胜".into(),
        })
    }
}

fn short_config() -> EngineConfig {
    EngineConfig {
        schedule: ScheduleConfig {
            free_rounds: 1,
            free_total_chars: 0,
        },
        ..EngineConfig::default()
    }
}

fn open(
    dir: &std::path::Path,
    config: EngineConfig,
    model: &Arc<ScriptedModel>,
    judge: &Arc<ScriptedJudge>,
) -> RoundOrchestrator {
    RoundOrchestrator::open(
        config,
        StateLayout::new(dir),
        model.clone(),
        judge.clone(),
    )
    .unwrap()
    .with_rng(StdRng::seed_from_u64(7))
}

#[tokio::test]
async fn test_full_session_rolls_over() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let judge = Arc::new(ScriptedJudge::new());
    let mut orch = open(dir.path(), short_config(), &model, &judge);
    let stages = orch.schedule().len();
    assert_eq!(stages, 8);

    let mut last = None;
    for i in 0..stages {
        let outcome = orch.run_round().await.unwrap();
        assert_eq!(outcome.round, i as u64 + 1);
        assert_eq!(outcome.topic, FALLBACK_TOPICS[0]);
        last = Some(outcome);
    }
    let last = last.unwrap();
    assert!(last.session_completed);
    assert_eq!(last.stage_key, "closing");
    assert_eq!(last.final_evaluation.unwrap().winner, Winner::P1);

    let session = orch.session();
    assert_eq!(session.session_id, 2);
    assert_eq!(session.stage_round, 0);
    assert!(session.topic.is_empty());
    assert_eq!(session.topic_history, vec![FALLBACK_TOPICS[0].to_string()]);

    let layout = orch.layout().clone();
    let archives: Vec<_> = std::fs::read_dir(layout.archives()).unwrap().collect();
    assert_eq!(archives.len(), 1);
    assert_eq!(std::fs::read_to_string(layout.conversation()).unwrap(), "");
    assert_eq!(std::fs::read_to_string(layout.plan(Persona::P1)).unwrap(), "");
    let experience = std::fs::read_to_string(layout.experience()).unwrap();
    assert!(experience.contains("Debate 1 | Topic:"));
    assert!(experience.contains("表现评估: 正方领先"));

    assert!(session.previous_context.contains("效率优先"));

    // The first session had no transcript to draw a topic from.
    assert!(model.topic_requests().is_empty());

    // The next session's topic is generated from the archived debate.
    let outcome = orch.run_round().await.unwrap();
    assert_eq!(outcome.topic, "生成的新题目？");
    assert_eq!(outcome.topic_source, Some(TopicSource::Generated));
    assert_eq!(outcome.session_id, 2);
    let topic_requests = model.topic_requests();
    assert_eq!(topic_requests.len(), 1);
    assert!(topic_requests[0].user.contains("效率优先"));
    let history = &orch.session().topic_history;
    let mut deduped = history.clone();
    deduped.dedup();
    assert_eq!(&deduped, history);
}

#[tokio::test]
async fn test_second_speaker_failure_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let judge = Arc::new(ScriptedJudge::new());
    let mut orch = open(dir.path(), short_config(), &model, &judge);
    model.fail_for(Some(Persona::P2));

    let err = orch.run_round().await.unwrap_err();
    assert!(matches!(
        err,
        RoundError::Transport {
            persona: Persona::P2,
            ..
        }
    ));
    assert!(err.is_retriable());
    assert_eq!(orch.session().round, 0);
    let layout = orch.layout().clone();
    assert!(!layout.session().exists());
    let transcript = persistence::read_text(&layout.conversation()).unwrap();
    assert!(!transcript.contains("P2 (Round 1)"));
    assert!(!transcript.contains("P1 (Round 1)"));

    model.fail_for(None);
    let outcome = orch.run_round().await.unwrap();
    assert_eq!(outcome.round, 1);
    assert_eq!(outcome.stage_key, "opening");
    assert!(persistence::read_text(&layout.conversation())
        .unwrap()
        .contains("P2 (Round 1)"));
}

#[tokio::test]
async fn test_judge_unavailable_skips_policy_update() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let judge = Arc::new(ScriptedJudge::new());
    judge.set_available(false);
    let mut orch = open(dir.path(), short_config(), &model, &judge);

    let outcome = orch.run_round().await.unwrap();
    assert!(outcome.evaluation.is_none());
    assert_eq!(orch.session().round, 1);
    assert_eq!(orch.session().scores.evaluated_rounds, 0);
    assert_eq!(orch.policy().last_updated_round(), None);
    assert_eq!(orch.policy().state(Persona::P1).step, 0);

    let events = std::fs::read_to_string(orch.journal().events_path()).unwrap();
    assert!(events.contains("judge_unavailable"));

    judge.set_available(true);
    let outcome = orch.run_round().await.unwrap();
    assert!(outcome.evaluation.is_some());
    assert_eq!(orch.policy().last_updated_round(), Some(2));
}

#[tokio::test]
async fn test_duplicate_replies_are_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::identical());
    let judge = Arc::new(ScriptedJudge::new());
    let mut orch = open(dir.path(), short_config(), &model, &judge);

    let outcome = orch.run_round().await.unwrap();
    assert!(outcome.replies_identical);

    let history = std::fs::read_to_string(orch.layout().policy_history()).unwrap();
    let entry: serde_json::Value = serde_json::from_str(history.lines().next().unwrap()).unwrap();
    assert_eq!(entry["duplicate_reply"], true);
}

#[tokio::test]
async fn test_exhausted_persona_passes_and_budget_jumps_to_closing() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        schedule: ScheduleConfig {
            free_rounds: 4,
            free_total_chars: 200,
        },
        ..EngineConfig::default()
    };
    let layout = StateLayout::new(dir.path());
    let schedule = debate_engine::StageSchedule::build(&config.schedule);
    let free_index = schedule
        .stages()
        .iter()
        .position(|s| s.is_free_debate())
        .unwrap();

    let mut session = Session::default();
    session.round = free_index as u64;
    session.stage_round = free_index;
    session.topic = "已定题目".into();
    session.record_topic("已定题目");
    session.free_stage_usage = PerPersona::new(200, 20);
    session.save(&layout.session()).unwrap();

    let model = Arc::new(ScriptedModel::new());
    let judge = Arc::new(ScriptedJudge::new());
    let mut orch = open(dir.path(), config.clone(), &model, &judge);

    let outcome = orch.run_round().await.unwrap();
    assert_eq!(outcome.skipped, vec![Persona::P1]);
    assert!(outcome.replies.p1.is_none());
    assert!(outcome.replies.p2.is_some());
    assert_eq!(model.persona_requests(Persona::P1), 0);

    // Both exhausted: the next round is the closing stage.
    let mut session = Session::load(&layout.session()).unwrap();
    session.free_stage_usage = PerPersona::new(200, 200);
    session.save(&layout.session()).unwrap();
    let mut orch = open(dir.path(), config, &model, &judge);
    let outcome = orch.run_round().await.unwrap();
    assert_eq!(outcome.stage_key, "closing");
    assert!(outcome.session_completed);
}

#[tokio::test]
async fn test_restart_resumes_at_next_stage() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let judge = Arc::new(ScriptedJudge::new());
    {
        let mut orch = open(dir.path(), short_config(), &model, &judge);
        orch.run_round().await.unwrap();
        orch.run_round().await.unwrap();
    }
    let mut orch = open(dir.path(), short_config(), &model, &judge);
    assert_eq!(orch.session().round, 2);
    assert_eq!(orch.policy().last_updated_round(), Some(2));
    let expected = orch.schedule().stages()[2].key.clone();
    let outcome = orch.run_round().await.unwrap();
    assert_eq!(outcome.round, 3);
    assert_eq!(outcome.stage_key, expected);

    orch.write_status(None, 10, None).unwrap();
    let status = debate_engine::orchestrator::read_status(orch.layout())
        .unwrap()
        .unwrap();
    assert_eq!(status.round, 3);
    assert_eq!(status.judge.evaluated_rounds, 3);
}

/// Replies from per-persona queues; the last reply repeats once a queue drains.
struct SequenceModel {
    replies: Mutex<PerPersona<VecDeque<&'static str>>>,
}

#[async_trait]
impl ModelClient for SequenceModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, TransportError> {
        let Some(persona) = request.persona else {
            return Ok(ModelResponse::text("{}"));
        };
        let mut replies = self.replies.lock().unwrap();
        let queue = &mut replies[persona];
        let reply = if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().copied().unwrap_or_default()
        };
        Ok(ModelResponse::text(reply))
    }
}

#[tokio::test]
async fn test_replies_classified_against_previous_round() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(SequenceModel {
        replies: Mutex::new(PerPersona::new(
            VecDeque::from(["陈述内容", "请回答：你的数据来源是什么？"]),
            VecDeque::from(["可以，原因如下"]),
        )),
    });
    let judge = Arc::new(ScriptedJudge::new());
    let mut orch = RoundOrchestrator::open(
        short_config(),
        StateLayout::new(dir.path()),
        model,
        judge,
    )
    .unwrap()
    .with_rng(StdRng::seed_from_u64(7));

    orch.run_round().await.unwrap();
    let outcome = orch.run_round().await.unwrap();
    assert_eq!(outcome.stage_key, "cross_1");

    // P2 answered this round's question, but is judged against P1's
    // previous-round statement, which applies no pressure.
    let p2 = &orch.dynamics().personas[Persona::P2];
    assert_eq!(p2.state, ConversationalState::Neutral);
    assert_eq!(p2.last_transition.as_deref(), Some("Neutral->Neutral"));
    assert_eq!(p2.last_reply, "可以，原因如下");
    assert_eq!(
        orch.dynamics().personas[Persona::P1].last_reply,
        "请回答：你的数据来源是什么？"
    );
}

#[tokio::test]
async fn test_failed_commit_leaves_plans_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let judge = Arc::new(ScriptedJudge::new());
    let mut orch = open(dir.path(), short_config(), &model, &judge);
    let layout = orch.layout().clone();

    // A directory where session.json belongs makes the final save fail.
    std::fs::create_dir_all(layout.session()).unwrap();
    assert!(orch.run_round().await.is_err());
    assert_eq!(orch.session().round, 0);
    assert_eq!(persistence::read_text(&layout.plan(Persona::P1)).unwrap(), "");

    std::fs::remove_dir(layout.session()).unwrap();
    let outcome = orch.run_round().await.unwrap();
    assert_eq!(outcome.round, 1);
    let plan = persistence::read_text(&layout.plan(Persona::P1)).unwrap();
    assert_eq!(plan.lines().count(), 1);
    assert!(plan.contains("要点"));
}
