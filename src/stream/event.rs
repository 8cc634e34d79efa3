//! Inbound feed records and validation
//!
//! Every source (live WebSocket, replay file) produces `RawFeedRecord`s in
//! PumpPortal's camelCase shape. `RawFeedRecord::validate` is the single gate
//! turning them into typed `FeedEvent`s.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wire shape of a feed record. Everything is optional so that validation,
/// not deserialization, decides what is malformed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFeedRecord {
    pub tx_type: Option<String>,
    pub mint: Option<String>,
    pub signature: Option<String>,
    /// Milliseconds since epoch
    pub timestamp: Option<i64>,
    pub market_cap_sol: Option<f64>,
    pub v_tokens_in_bonding_curve: Option<f64>,
    pub v_sol_in_bonding_curve: Option<f64>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub initial_buy: Option<f64>,
    pub trader_public_key: Option<String>,
    pub token_amount: Option<f64>,
    pub new_token_balance: Option<f64>,
    pub sol_amount: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn is_buy(&self) -> bool {
        matches!(self, TradeSide::Buy)
    }
}

/// Token creation
#[derive(Debug, Clone, PartialEq)]
pub struct CreateEvent {
    pub mint: String,
    pub signature: Option<String>,
    pub timestamp: i64,
    pub name: String,
    pub symbol: String,
    pub creator: String,
    /// Tokens bought by the creator in the create transaction
    pub initial_buy: f64,
    pub market_cap_sol: f64,
    pub v_tokens: f64,
    pub v_sol: f64,
}

/// Buy or sell against the bonding curve
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub mint: String,
    pub signature: Option<String>,
    pub timestamp: i64,
    pub side: TradeSide,
    pub trader: String,
    pub token_amount: f64,
    /// Trader's token balance after this trade
    pub new_balance: f64,
    pub sol_amount: Option<f64>,
    pub market_cap_sol: f64,
    pub v_tokens: f64,
    pub v_sol: f64,
}

impl TradeEvent {
    /// Spot price after the trade
    pub fn price(&self) -> f64 {
        self.v_sol / self.v_tokens
    }

    /// SOL volume, estimated from the post-trade price when the feed omits it
    pub fn volume_sol(&self) -> f64 {
        self.sol_amount
            .unwrap_or_else(|| self.token_amount * self.price())
            .abs()
    }

    /// Key used to recognise replays of the same trade at one timestamp
    pub fn dedup_key(&self) -> String {
        match &self.signature {
            Some(sig) => sig.clone(),
            None => format!(
                "{}:{:?}:{}:{}:{}",
                self.trader, self.side, self.token_amount, self.new_balance, self.v_sol
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Create(CreateEvent),
    Trade(TradeEvent),
}

impl FeedEvent {
    pub fn mint(&self) -> &str {
        match self {
            FeedEvent::Create(e) => &e.mint,
            FeedEvent::Trade(e) => &e.mint,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            FeedEvent::Create(e) => e.timestamp,
            FeedEvent::Trade(e) => e.timestamp,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, FeedEvent::Create(_))
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::MalformedEvent(format!("missing field `{}`", field)))
}

fn finite_non_negative(value: f64, field: &str) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(Error::MalformedEvent(format!(
            "`{}` must be finite and non-negative, got {}",
            field, value
        )))
    }
}

fn positive(value: f64, field: &str) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::MalformedEvent(format!(
            "`{}` must be positive, got {}",
            field, value
        )))
    }
}

fn address(value: Option<String>, field: &str) -> Result<String> {
    let value = required(value, field)?;
    let decoded = bs58::decode(&value)
        .into_vec()
        .map_err(|e| Error::MalformedEvent(format!("`{}` is not base58: {}", field, e)))?;
    if decoded.is_empty() {
        return Err(Error::MalformedEvent(format!("`{}` is empty", field)));
    }
    Ok(value)
}

impl RawFeedRecord {
    /// Check required fields and ranges, producing a typed event
    pub fn validate(self) -> Result<FeedEvent> {
        let tx_type = required(self.tx_type, "txType")?;
        let mint = address(self.mint, "mint")?;
        let timestamp = required(self.timestamp, "timestamp")?;
        if timestamp <= 0 {
            return Err(Error::MalformedEvent(format!(
                "`timestamp` must be positive, got {}",
                timestamp
            )));
        }
        let market_cap_sol =
            finite_non_negative(required(self.market_cap_sol, "marketCapSol")?, "marketCapSol")?;
        let v_tokens = positive(
            required(self.v_tokens_in_bonding_curve, "vTokensInBondingCurve")?,
            "vTokensInBondingCurve",
        )?;
        let v_sol = positive(
            required(self.v_sol_in_bonding_curve, "vSolInBondingCurve")?,
            "vSolInBondingCurve",
        )?;

        match tx_type.as_str() {
            "create" => Ok(FeedEvent::Create(CreateEvent {
                mint,
                signature: self.signature,
                timestamp,
                name: required(self.name, "name")?,
                symbol: required(self.symbol, "symbol")?,
                creator: address(self.trader_public_key, "traderPublicKey")?,
                initial_buy: finite_non_negative(self.initial_buy.unwrap_or(0.0), "initialBuy")?,
                market_cap_sol,
                v_tokens,
                v_sol,
            })),
            "buy" | "sell" => {
                let side = if tx_type == "buy" {
                    TradeSide::Buy
                } else {
                    TradeSide::Sell
                };
                let sol_amount = match self.sol_amount {
                    Some(v) => Some(finite_non_negative(v, "solAmount")?),
                    None => None,
                };
                Ok(FeedEvent::Trade(TradeEvent {
                    mint,
                    signature: self.signature,
                    timestamp,
                    side,
                    trader: address(self.trader_public_key, "traderPublicKey")?,
                    token_amount: finite_non_negative(
                        required(self.token_amount, "tokenAmount")?,
                        "tokenAmount",
                    )?,
                    new_balance: finite_non_negative(
                        required(self.new_token_balance, "newTokenBalance")?,
                        "newTokenBalance",
                    )?,
                    sol_amount,
                    market_cap_sol,
                    v_tokens,
                    v_sol,
                }))
            }
            other => Err(Error::MalformedEvent(format!("unknown txType `{}`", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";
    const TRADER: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    #[test]
    fn test_parse_create_record() {
        let json = format!(
            r#"{{
                "signature": "sig1",
                "mint": "{MINT}",
                "traderPublicKey": "{TRADER}",
                "txType": "create",
                "initialBuy": 60000000,
                "vTokensInBondingCurve": 1013000000,
                "vSolInBondingCurve": 31.5,
                "marketCapSol": 31.1,
                "name": "Test Token",
                "symbol": "TEST",
                "timestamp": 1700000000000
            }}"#
        );
        let raw: RawFeedRecord = serde_json::from_str(&json).unwrap();
        match raw.validate().unwrap() {
            FeedEvent::Create(create) => {
                assert_eq!(create.symbol, "TEST");
                assert_eq!(create.creator, TRADER);
                assert_eq!(create.initial_buy, 60_000_000.0);
            }
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_sell_record() {
        let json = format!(
            r#"{{"txType":"sell","mint":"{MINT}","traderPublicKey":"{TRADER}",
                "tokenAmount":1000.0,"newTokenBalance":0.0,"marketCapSol":40.0,
                "vTokensInBondingCurve":800000000,"vSolInBondingCurve":32.0,
                "timestamp":1700000001000}}"#
        );
        let raw: RawFeedRecord = serde_json::from_str(&json).unwrap();
        let FeedEvent::Trade(trade) = raw.validate().unwrap() else {
            panic!("expected trade");
        };
        assert_eq!(trade.side, TradeSide::Sell);
        assert!((trade.price() - 4e-8).abs() < 1e-15);
        assert!((trade.volume_sol() - 1000.0 * 4e-8).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_missing_and_invalid_fields() {
        let base = RawFeedRecord {
            tx_type: Some("buy".into()),
            mint: Some(MINT.into()),
            timestamp: Some(1),
            market_cap_sol: Some(30.0),
            v_tokens_in_bonding_curve: Some(1.0e9),
            v_sol_in_bonding_curve: Some(30.0),
            trader_public_key: Some(TRADER.into()),
            token_amount: Some(10.0),
            new_token_balance: Some(10.0),
            ..Default::default()
        };
        assert!(base.clone().validate().is_ok());

        let mut missing = base.clone();
        missing.new_token_balance = None;
        assert!(matches!(missing.validate(), Err(Error::MalformedEvent(_))));

        let mut bad_mint = base.clone();
        bad_mint.mint = Some("not-base58-0OIl".into());
        assert!(matches!(bad_mint.validate(), Err(Error::MalformedEvent(_))));

        let mut zero_reserve = base.clone();
        zero_reserve.v_sol_in_bonding_curve = Some(0.0);
        assert!(matches!(zero_reserve.validate(), Err(Error::MalformedEvent(_))));

        let mut unknown = base;
        unknown.tx_type = Some("migrate".into());
        assert!(matches!(unknown.validate(), Err(Error::MalformedEvent(_))));
    }
}
