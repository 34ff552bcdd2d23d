//! 成绩簿 - 基础设施层
//!
//! 持有全部评估、评估实例和实例题目，只暴露"查找 / 加锁"能力。
//!
//! 每个实例题目和每个评估实例各有一把 `tokio::sync::Mutex`。
//! 需要同时持有两把锁时，顺序固定为：实例题目 → 评估实例。
//! 各索引表的读写锁只在查找期间短暂持有，不会与实体锁交叉。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{AppResult, StoreError};
use crate::models::{
    Assessment, AssessmentId, AssessmentInstance, AssessmentInstanceId, AssessmentQuestionId,
    InstanceQuestion, InstanceQuestionId, RubricConfig, SubmissionId,
};

/// 评估实例的索引信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceKey {
    pub assessment_id: AssessmentId,
    pub uid: String,
    pub number: u32,
}

/// 实例题目的索引信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionKey {
    pub assessment_instance_id: AssessmentInstanceId,
    pub assessment_question_id: AssessmentQuestionId,
}

/// 内存成绩簿
pub struct Gradebook {
    next_id: AtomicU64,
    assessments: RwLock<BTreeMap<AssessmentId, Arc<Assessment>>>,
    assessment_instances: RwLock<BTreeMap<AssessmentInstanceId, Arc<Mutex<AssessmentInstance>>>>,
    instance_questions: RwLock<BTreeMap<InstanceQuestionId, Arc<Mutex<InstanceQuestion>>>>,
    instance_keys: RwLock<BTreeMap<AssessmentInstanceId, InstanceKey>>,
    question_keys: RwLock<BTreeMap<InstanceQuestionId, QuestionKey>>,
    rubrics: RwLock<HashMap<AssessmentQuestionId, RubricConfig>>,
    submission_index: RwLock<HashMap<SubmissionId, InstanceQuestionId>>,
}

impl Gradebook {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            assessments: RwLock::new(BTreeMap::new()),
            assessment_instances: RwLock::new(BTreeMap::new()),
            instance_questions: RwLock::new(BTreeMap::new()),
            instance_keys: RwLock::new(BTreeMap::new()),
            question_keys: RwLock::new(BTreeMap::new()),
            rubrics: RwLock::new(HashMap::new()),
            submission_index: RwLock::new(HashMap::new()),
        }
    }

    /// 分配一个全局唯一 ID
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========== 评估 ==========

    /// 发布评估：为评估及其题目分配 ID
    pub async fn insert_assessment(&self, mut assessment: Assessment) -> AppResult<Arc<Assessment>> {
        let mut assessments = self.assessments.write().await;
        if assessments.values().any(|a| a.tid == assessment.tid) {
            return Err(StoreError::DuplicateAssessment(assessment.tid).into());
        }

        assessment.id = self.next_id();
        for zone in &mut assessment.zones {
            for question in &mut zone.questions {
                question.id = self.next_id();
            }
        }

        let assessment = Arc::new(assessment);
        assessments.insert(assessment.id, assessment.clone());
        debug!(
            "发布评估 {} (#{}), 满分 {}",
            assessment.tid,
            assessment.id,
            assessment.max_points()
        );
        Ok(assessment)
    }

    pub async fn assessment(&self, id: AssessmentId) -> AppResult<Arc<Assessment>> {
        self.assessments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::AssessmentNotFound(id).into())
    }

    pub async fn assessment_by_tid(&self, tid: &str) -> AppResult<Arc<Assessment>> {
        self.assessments
            .read()
            .await
            .values()
            .find(|a| a.tid == tid)
            .cloned()
            .ok_or_else(|| StoreError::AssessmentTidNotFound(tid.to_string()).into())
    }

    /// 按发布顺序返回所有评估
    pub async fn assessments(&self) -> Vec<Arc<Assessment>> {
        self.assessments.read().await.values().cloned().collect()
    }

    // ========== 评估实例 ==========

    /// 为学生创建新的评估实例及其全部实例题目
    pub async fn create_assessment_instance(
        &self,
        assessment_id: AssessmentId,
        uid: &str,
        username: &str,
    ) -> AppResult<AssessmentInstanceId> {
        let assessment = self.assessment(assessment_id).await?;

        let mut keys = self.instance_keys.write().await;
        let number = keys
            .values()
            .filter(|k| k.assessment_id == assessment_id && k.uid == uid)
            .count() as u32
            + 1;

        let ai_id = self.next_id();
        let mut instance = AssessmentInstance::new(
            ai_id,
            assessment_id,
            uid,
            username,
            number,
            assessment.max_points(),
        );

        let mut questions = self.instance_questions.write().await;
        let mut question_keys = self.question_keys.write().await;
        for (index, aq) in assessment.questions().enumerate() {
            let iq_id = self.next_id();
            let iq = InstanceQuestion::new(iq_id, ai_id, aq.id, index + 1, aq.initial_value());
            questions.insert(iq_id, Arc::new(Mutex::new(iq)));
            question_keys.insert(
                iq_id,
                QuestionKey {
                    assessment_instance_id: ai_id,
                    assessment_question_id: aq.id,
                },
            );
            instance.instance_question_ids.push(iq_id);
            instance.question_points.insert(aq.id, 0.0);
        }

        keys.insert(
            ai_id,
            InstanceKey {
                assessment_id,
                uid: uid.to_string(),
                number,
            },
        );
        self.assessment_instances
            .write()
            .await
            .insert(ai_id, Arc::new(Mutex::new(instance)));

        debug!(
            "创建评估实例 #{}: 评估 {} 学生 {} 第 {} 次",
            ai_id, assessment.tid, uid, number
        );
        Ok(ai_id)
    }

    pub async fn assessment_instance(
        &self,
        id: AssessmentInstanceId,
    ) -> AppResult<Arc<Mutex<AssessmentInstance>>> {
        self.assessment_instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::AssessmentInstanceNotFound(id).into())
    }

    pub async fn instance_key(&self, id: AssessmentInstanceId) -> AppResult<InstanceKey> {
        self.instance_keys
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::AssessmentInstanceNotFound(id).into())
    }

    /// 按学生和实例序号查找评估实例
    pub async fn find_assessment_instance(
        &self,
        assessment_id: AssessmentId,
        uid: &str,
        number: u32,
    ) -> Option<AssessmentInstanceId> {
        self.instance_keys
            .read()
            .await
            .iter()
            .find(|(_, k)| k.assessment_id == assessment_id && k.uid == uid && k.number == number)
            .map(|(id, _)| *id)
    }

    /// 评估的全部实例 ID（按创建顺序）
    pub async fn assessment_instance_ids(&self, assessment_id: AssessmentId) -> Vec<AssessmentInstanceId> {
        self.instance_keys
            .read()
            .await
            .iter()
            .filter(|(_, k)| k.assessment_id == assessment_id)
            .map(|(id, _)| *id)
            .collect()
    }

    // ========== 实例题目 ==========

    pub async fn instance_question(
        &self,
        id: InstanceQuestionId,
    ) -> AppResult<Arc<Mutex<InstanceQuestion>>> {
        self.instance_questions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::InstanceQuestionNotFound(id).into())
    }

    pub async fn question_key(&self, id: InstanceQuestionId) -> AppResult<QuestionKey> {
        self.question_keys
            .read()
            .await
            .get(&id)
            .copied()
            .ok_or_else(|| StoreError::InstanceQuestionNotFound(id).into())
    }

    /// 按评估实例和评估题目查找实例题目
    pub async fn find_instance_question(
        &self,
        assessment_instance_id: AssessmentInstanceId,
        assessment_question_id: AssessmentQuestionId,
    ) -> Option<InstanceQuestionId> {
        self.question_keys
            .read()
            .await
            .iter()
            .find(|(_, k)| {
                k.assessment_instance_id == assessment_instance_id
                    && k.assessment_question_id == assessment_question_id
            })
            .map(|(id, _)| *id)
    }

    /// 某个评估实例的全部实例题目 ID（按题号顺序）
    pub async fn instance_question_ids(
        &self,
        assessment_instance_id: AssessmentInstanceId,
    ) -> Vec<InstanceQuestionId> {
        self.question_keys
            .read()
            .await
            .iter()
            .filter(|(_, k)| k.assessment_instance_id == assessment_instance_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// 某个评估的全部实例题目 ID
    pub async fn instance_question_ids_for_assessment(
        &self,
        assessment_id: AssessmentId,
    ) -> Vec<InstanceQuestionId> {
        let instances = self.assessment_instance_ids(assessment_id).await;
        self.question_keys
            .read()
            .await
            .iter()
            .filter(|(_, k)| instances.contains(&k.assessment_instance_id))
            .map(|(id, _)| *id)
            .collect()
    }

    // ========== 提交索引 ==========

    pub async fn register_submission(&self, submission_id: SubmissionId, iq_id: InstanceQuestionId) {
        self.submission_index
            .write()
            .await
            .insert(submission_id, iq_id);
    }

    pub async fn instance_question_for_submission(
        &self,
        submission_id: SubmissionId,
    ) -> AppResult<InstanceQuestionId> {
        self.submission_index
            .read()
            .await
            .get(&submission_id)
            .copied()
            .ok_or_else(|| StoreError::SubmissionNotFound(submission_id).into())
    }

    // ========== 评分细则 ==========

    /// 评估题目的细则配置，未配置时返回默认值
    pub async fn rubric(&self, assessment_question_id: AssessmentQuestionId) -> RubricConfig {
        self.rubrics
            .read()
            .await
            .get(&assessment_question_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_rubric(&self, assessment_question_id: AssessmentQuestionId, config: RubricConfig) {
        self.rubrics
            .write()
            .await
            .insert(assessment_question_id, config);
    }
}

impl Default for Gradebook {
    fn default() -> Self {
        Self::new()
    }
}
