//! 事件总线
//!
//! 每个会话一条 append-only 事件日志：序号自 1 起单调递增、无空洞，
//! 发布与对应的内部状态变更同步发生（订阅者不会观测到未真实发生的转移）。
//! 订阅可从任意已观测序号重启（重连场景），在窗口内严格不重不漏；
//! 日志以环形窗口截断，超出窗口的旧事件被淘汰。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

/// 编排生命周期事件类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestReceived,
    DelegationStarted,
    AgentInvoked,
    ToolCalled,
    ToolResult,
    AgentResult,
    AggregationDone,
    RequestFailed,
}

/// 一条事件：会话内单调序号 + 类型 + 负载
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub seq: u64,
    pub session_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

struct SessionLog {
    events: VecDeque<Event>,
    next_seq: u64,
}

struct SessionChannel {
    log: Mutex<SessionLog>,
    notify: Notify,
}

/// 事件总线：session_id -> 环形事件日志
pub struct EventBus {
    channels: Mutex<HashMap<String, Arc<SessionChannel>>>,
    window: usize,
}

impl EventBus {
    pub fn new(window: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    fn channel(&self, session_id: &str) -> Arc<SessionChannel> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionChannel {
                    log: Mutex::new(SessionLog {
                        events: VecDeque::new(),
                        next_seq: 1,
                    }),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// 发布一条事件，返回分配的序号
    pub fn publish(&self, session_id: &str, kind: EventKind, payload: serde_json::Value) -> u64 {
        let chan = self.channel(session_id);
        let seq = {
            let mut log = chan.log.lock().unwrap();
            let seq = log.next_seq;
            log.next_seq += 1;
            log.events.push_back(Event {
                seq,
                session_id: session_id.to_string(),
                kind,
                payload,
                at: Utc::now(),
            });
            while log.events.len() > self.window {
                log.events.pop_front();
            }
            seq
        };
        chan.notify.notify_waiters();
        seq
    }

    /// 从 from_seq 之后开始订阅：先补发窗口内 seq > from_seq 的事件，再持续收取新事件
    pub fn subscribe(&self, session_id: &str, from_seq: u64) -> EventSubscription {
        EventSubscription {
            chan: self.channel(session_id),
            cursor: from_seq,
        }
    }
}

/// 消费者自步调的事件订阅（pull 式）
pub struct EventSubscription {
    chan: Arc<SessionChannel>,
    cursor: u64,
}

impl EventSubscription {
    /// 非阻塞取下一条；无新事件时返回 None
    pub fn try_next(&mut self) -> Option<Event> {
        let log = self.chan.log.lock().unwrap();
        let next = log.events.iter().find(|e| e.seq > self.cursor).cloned();
        if let Some(ref e) = next {
            self.cursor = e.seq;
        }
        next
    }

    /// 等待下一条事件
    pub async fn next(&mut self) -> Event {
        loop {
            // 先注册唤醒再检查，避免漏掉两步之间发布的事件
            let chan = Arc::clone(&self.chan);
            let notified = chan.notify.notified();
            if let Some(e) = self.try_next() {
                return e;
            }
            notified.await;
        }
    }

    /// 一次性取走当前窗口内所有待读事件
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(e) = self.try_next() {
            out.push(e);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic_and_gap_free() {
        let bus = EventBus::new(64);
        for _ in 0..10 {
            bus.publish("s1", EventKind::AgentInvoked, serde_json::json!({}));
        }
        let mut sub = bus.subscribe("s1", 0);
        let events = sub.drain();
        assert_eq!(events.len(), 10);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.seq, i as u64 + 1);
        }
    }

    #[test]
    fn test_resubscribe_from_seen_seq_yields_only_later_events() {
        let bus = EventBus::new(64);
        for _ in 0..5 {
            bus.publish("s1", EventKind::ToolCalled, serde_json::json!({}));
        }
        let mut sub = bus.subscribe("s1", 3);
        let events = sub.drain();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_sessions_are_independent_streams() {
        let bus = EventBus::new(64);
        bus.publish("a", EventKind::RequestReceived, serde_json::json!({}));
        bus.publish("b", EventKind::RequestReceived, serde_json::json!({}));
        bus.publish("b", EventKind::RequestFailed, serde_json::json!({}));

        assert_eq!(bus.subscribe("a", 0).drain().len(), 1);
        assert_eq!(bus.subscribe("b", 0).drain().len(), 2);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let bus = EventBus::new(3);
        for _ in 0..5 {
            bus.publish("s", EventKind::AgentResult, serde_json::json!({}));
        }
        let events = bus.subscribe("s", 0).drain();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_live_subscriber_is_woken() {
        let bus = Arc::new(EventBus::new(16));
        let mut sub = bus.subscribe("s", 0);
        let bus2 = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            bus2.publish("s", EventKind::AggregationDone, serde_json::json!({}));
        });
        let e = sub.next().await;
        assert_eq!(e.kind, EventKind::AggregationDone);
    }
}
