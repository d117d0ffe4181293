//! JSON-RPC 2.0 framing and method dispatch.
//!
//! Every method mirrors an internal capability exactly; the gateway
//! contributes validation and error mapping only. Engine errors surface
//! as JSON-RPC error objects with the taxonomy code in `error.data.code`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::executor::{Actor, IntentRecord, TradeExecutor, TradeIntent};
use crate::models::{now_ts, PerpSide, PredictionSide};
use crate::pricing;
use crate::store::{
    OrganizationStore, PerpPositionStore, PredictionMarketStore, SocialStore, UserStore,
};

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    pub data: Value,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<Value>, error: &EngineError) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcErrorObject {
                code: error.jsonrpc_code(),
                message: error.to_string(),
                data: json!({ "code": error.kind_code() }),
            }),
            id,
        }
    }

    pub fn invalid_request(id: Option<Value>, message: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcErrorObject {
                code: -32600,
                message: message.to_string(),
                data: json!({ "code": "invalid_request" }),
            }),
            id,
        }
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcErrorObject {
                code: -32601,
                message: format!("method not found: {method}"),
                data: json!({ "code": "not_found" }),
            }),
            id,
        }
    }
}

#[derive(Clone)]
pub struct A2aGateway {
    users: UserStore,
    markets: PredictionMarketStore,
    orgs: OrganizationStore,
    perps: PerpPositionStore,
    social: SocialStore,
    executor: TradeExecutor,
}

impl A2aGateway {
    pub fn new(db: Db, executor: TradeExecutor) -> Self {
        Self {
            users: UserStore::new(db.clone()),
            markets: PredictionMarketStore::new(db.clone()),
            orgs: OrganizationStore::new(db.clone()),
            perps: PerpPositionStore::new(db.clone()),
            social: SocialStore::new(db.clone()),
            executor,
        }
    }

    /// Dispatch one authenticated request.
    pub async fn dispatch(&self, caller_id: i64, request: &RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        let result = self.call(caller_id, &request.method, &request.params).await;
        match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(e) => RpcResponse::failure(id, &e),
        }
    }

    async fn call(&self, caller_id: i64, method: &str, params: &Value) -> EngineResult<Value> {
        // Caller must exist and be in good standing for every method.
        let caller = self.users.get(caller_id).await?;
        if caller.is_banned {
            return Err(EngineError::UserBanned(caller_id));
        }

        match method {
            "a2a.getPredictions" => self.get_predictions().await,
            "a2a.getPerpetuals" => self.get_perpetuals(caller_id).await,
            "a2a.buyShares" => self.buy_shares(caller_id, params).await,
            "a2a.openPerp" => self.open_perp(caller_id, params).await,
            "a2a.closePerp" => self.close_perp(caller_id, params).await,
            "a2a.blockUser" => self.moderate_user(caller_id, "block", params).await,
            "a2a.muteUser" => self.moderate_user(caller_id, "mute", params).await,
            "a2a.reportUser" => self.moderate_user(caller_id, "report_user", params).await,
            "a2a.reportPost" => self.report_post(caller_id, params).await,
            other => Err(EngineError::NotFound(format!("method {other}"))),
        }
    }

    async fn get_predictions(&self) -> EngineResult<Value> {
        let markets = self.markets.list_open(now_ts()).await?;
        let items: Vec<Value> = markets
            .iter()
            .map(|m| {
                let yes = pricing::price_yes(m.q_yes, m.q_no, m.b);
                json!({
                    "market_id": m.id,
                    "prompt": m.prompt,
                    "category": m.category,
                    "resolution_time": m.resolution_time,
                    "yes_price": yes,
                    "no_price": 1.0 - yes,
                })
            })
            .collect();
        Ok(json!({ "markets": items }))
    }

    async fn get_perpetuals(&self, caller_id: i64) -> EngineResult<Value> {
        let orgs = self.orgs.list().await?;
        let positions = self.perps.list_open_for_user(caller_id).await?;
        let markets: Vec<Value> = orgs
            .iter()
            .map(|o| {
                json!({
                    "ticker": o.ticker,
                    "price": o.current_price,
                    "funding_rate": o.funding_rate,
                })
            })
            .collect();
        let own: Vec<Value> = positions
            .iter()
            .map(|p| {
                json!({
                    "position_id": p.id,
                    "ticker": p.ticker,
                    "side": p.side.as_str(),
                    "size": p.size,
                    "leverage": p.leverage,
                    "entry_price": p.entry_price,
                    "liquidation_price": p.liquidation_price,
                    "funding_paid": p.funding_paid,
                })
            })
            .collect();
        Ok(json!({ "markets": markets, "positions": own }))
    }

    async fn buy_shares(&self, caller_id: i64, params: &Value) -> EngineResult<Value> {
        let market_id = require_i64(params, "market_id")?;
        let side = PredictionSide::parse(require_str(params, "side")?)
            .ok_or_else(|| EngineError::NotFound("side must be yes or no".to_string()))?;
        let cash = require_positive_f64(params, "cash")?;

        let trade = self
            .executor
            .execute_one(&IntentRecord {
                intent_id: format!("a2a:{caller_id}:{}", uuid::Uuid::new_v4()),
                actor: Actor::User(caller_id),
                intent: TradeIntent::BuyPredictionShares {
                    market_id,
                    side,
                    cash,
                    expected_price: params.get("expected_price").and_then(|v| v.as_f64()),
                },
            })
            .await?;

        Ok(json!({
            "position_id": trade.position_id,
            "shares": trade.impact.share_delta,
            "cash_spent": trade.impact.cash_delta,
        }))
    }

    async fn open_perp(&self, caller_id: i64, params: &Value) -> EngineResult<Value> {
        let ticker = require_str(params, "ticker")?.trim().to_uppercase();
        let side = PerpSide::parse(require_str(params, "side")?)
            .ok_or_else(|| EngineError::NotFound("side must be long or short".to_string()))?;
        let size = require_positive_f64(params, "size")?;
        let leverage = params
            .get("leverage")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);

        let trade = self
            .executor
            .execute_one(&IntentRecord {
                intent_id: format!("a2a:{caller_id}:{}", uuid::Uuid::new_v4()),
                actor: Actor::User(caller_id),
                intent: TradeIntent::OpenPerp {
                    ticker,
                    side,
                    size,
                    leverage,
                    expected_price: params.get("expected_price").and_then(|v| v.as_f64()),
                },
            })
            .await?;

        Ok(json!({
            "position_id": trade.position_id,
            "margin_debited": trade.impact.cash_delta,
        }))
    }

    async fn close_perp(&self, caller_id: i64, params: &Value) -> EngineResult<Value> {
        let ticker = require_str(params, "ticker")?.trim().to_uppercase();
        let trade = self
            .executor
            .execute_one(&IntentRecord {
                intent_id: format!("a2a:{caller_id}:{}", uuid::Uuid::new_v4()),
                actor: Actor::User(caller_id),
                intent: TradeIntent::ClosePerp { ticker },
            })
            .await?;
        Ok(json!({
            "position_id": trade.position_id,
            "realized_pnl": trade.realized_pnl,
        }))
    }

    async fn moderate_user(
        &self,
        caller_id: i64,
        kind: &str,
        params: &Value,
    ) -> EngineResult<Value> {
        let target = require_i64(params, "user_id")?;
        // Validate the target exists so moderation rows reference real
        // users.
        self.users.get(target).await?;
        let reason = params.get("reason").and_then(|v| v.as_str());
        let id = self
            .social
            .record_moderation(caller_id, kind, Some(target), None, reason)
            .await?;
        Ok(json!({ "moderation_id": id }))
    }

    async fn report_post(&self, caller_id: i64, params: &Value) -> EngineResult<Value> {
        let post_id = require_i64(params, "post_id")?;
        let reason = params.get("reason").and_then(|v| v.as_str());
        let id = self
            .social
            .record_moderation(caller_id, "report_post", None, Some(post_id), reason)
            .await?;
        Ok(json!({ "moderation_id": id }))
    }
}

fn require_i64(params: &Value, key: &str) -> EngineResult<i64> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| EngineError::NotFound(format!("missing or invalid param: {key}")))
}

fn require_str<'a>(params: &'a Value, key: &str) -> EngineResult<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::NotFound(format!("missing or invalid param: {key}")))
}

fn require_positive_f64(params: &Value, key: &str) -> EngineResult<f64> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| EngineError::NotFound(format!("missing or invalid param: {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ledger::Ledger;
    use crate::models::BalanceTxKind;

    async fn gateway_fixture() -> (Db, A2aGateway, i64) {
        let db = Db::open_in_memory().unwrap();
        let cfg = EngineConfig::default();
        let users = UserStore::new(db.clone());
        let caller = users.create_human("caller").await.unwrap();
        Ledger::new(db.clone())
            .credit(caller, 1000.0, BalanceTxKind::Deposit, None)
            .await
            .unwrap();
        let gateway = A2aGateway::new(db.clone(), TradeExecutor::new(db.clone(), &cfg));
        (db, gateway, caller)
    }

    fn req(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn buy_shares_round_trips_through_executor() {
        let (db, gateway, caller) = gateway_fixture().await;
        let market = PredictionMarketStore::new(db.clone())
            .create("a2a?", "general", now_ts() + 3600, 100.0)
            .await
            .unwrap();

        let resp = gateway
            .dispatch(
                caller,
                &req(
                    "a2a.buyShares",
                    json!({"market_id": market.id, "side": "yes", "cash": 10.0}),
                ),
            )
            .await;
        let result = resp.result.expect("success");
        assert!(result["shares"].as_f64().unwrap() > 0.0);
        assert!((result["cash_spent"].as_f64().unwrap() - 10.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn errors_carry_taxonomy_code() {
        let (_db, gateway, caller) = gateway_fixture().await;
        let resp = gateway
            .dispatch(
                caller,
                &req(
                    "a2a.buyShares",
                    json!({"market_id": 999, "side": "yes", "cash": 10.0}),
                ),
            )
            .await;
        let error = resp.error.expect("failure");
        assert_eq!(error.data["code"], "not_found");
    }

    #[tokio::test]
    async fn unknown_method_rejected() {
        let (_db, gateway, caller) = gateway_fixture().await;
        let resp = gateway
            .dispatch(caller, &req("a2a.mintTokens", json!({})))
            .await;
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn banned_caller_rejected_everywhere() {
        let (db, gateway, caller) = gateway_fixture().await;
        UserStore::new(db).set_banned(caller, true).await.unwrap();
        let resp = gateway
            .dispatch(caller, &req("a2a.getPredictions", json!({})))
            .await;
        assert_eq!(resp.error.unwrap().data["code"], "user_banned");
    }

    #[tokio::test]
    async fn moderation_records_action() {
        let (db, gateway, caller) = gateway_fixture().await;
        let other = UserStore::new(db.clone())
            .create_human("other")
            .await
            .unwrap();
        let resp = gateway
            .dispatch(
                caller,
                &req("a2a.blockUser", json!({"user_id": other, "reason": "spam"})),
            )
            .await;
        assert!(resp.result.is_some());

        let count: i64 = {
            let conn = db.lock().await;
            conn.query_row(
                "SELECT COUNT(*) FROM moderation_actions WHERE kind = 'block'",
                [],
                |r| r.get(0),
            )
            .unwrap()
        };
        assert_eq!(count, 1);
    }
}
