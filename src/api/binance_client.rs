//! Binance spot REST client for prices, symbol rules and market orders.
//!
//! Public endpoints (ticker, exchange info) need no credentials. Orders are
//! signed with HMAC-SHA256 over the query string and carry the API key in the
//! `X-MBX-APIKEY` header.
//!
//! In simulated mode nothing reaches the order book: the order is validated
//! against `/api/v3/order/test` when credentials exist, then filled
//! synthetically at the current ticker price.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::TradeSide;
use crate::trading::LotFilter;

use super::types::*;
use super::venue::{FillStatus, OrderFill, SymbolRules, Venue, VenueError, VenueResult};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5000;
const PRICE_RETRY_BUDGET: Duration = Duration::from_secs(20);

/// Binance error code for an unknown symbol.
const INVALID_SYMBOL: i64 = -1121;

/// API key pair.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Build from an optional key and secret; one without the other is an error.
    pub fn from_parts(api_key: Option<String>, api_secret: Option<String>) -> Result<Option<Self>> {
        let api_key = api_key.filter(|v| !v.trim().is_empty());
        let api_secret = api_secret.filter(|v| !v.trim().is_empty());

        match (api_key, api_secret) {
            (Some(api_key), Some(api_secret)) => Ok(Some(Self {
                api_key,
                api_secret,
            })),
            (Some(_), None) => {
                anyhow::bail!("BINANCE_API_KEY is set but BINANCE_API_SECRET is missing")
            }
            (None, Some(_)) => {
                anyhow::bail!("BINANCE_API_SECRET is set but BINANCE_API_KEY is missing")
            }
            (None, None) => Ok(None),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

/// Binance spot client.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    live: bool,
    sim_fee_rate: Decimal,
    /// Rules of every symbol looked up so far
    rules: RwLock<HashMap<String, SymbolRules>>,
}

impl BinanceClient {
    /// Create a client against `https://api.binance.{tld}`.
    ///
    /// Live mode requires credentials.
    pub fn new(
        tld: &str,
        credentials: Option<Credentials>,
        live: bool,
        sim_fee_rate: Decimal,
    ) -> Result<Self> {
        Self::with_base_url(
            format!("https://api.binance.{}", tld),
            credentials,
            live,
            sim_fee_rate,
        )
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(
        base_url: String,
        credentials: Option<Credentials>,
        live: bool,
        sim_fee_rate: Decimal,
    ) -> Result<Self> {
        if live && credentials.is_none() {
            anyhow::bail!("Live trading requires BINANCE_API_KEY and BINANCE_API_SECRET");
        }

        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url,
            credentials,
            live,
            sim_fee_rate,
            rules: RwLock::new(HashMap::new()),
        })
    }

    /// Create from environment variables.
    ///
    /// `BINANCE_API_KEY` and `BINANCE_API_SECRET` are optional in simulated
    /// mode but must be set together. `BINANCE_TLD` defaults to `com`.
    pub fn from_env(live: bool, sim_fee_rate: Decimal) -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").ok();
        let api_secret = std::env::var("BINANCE_API_SECRET").ok();
        let tld = std::env::var("BINANCE_TLD").unwrap_or_else(|_| "com".to_string());

        if tld != "com" && tld != "us" {
            anyhow::bail!("Invalid BINANCE_TLD '{}': expected 'com' or 'us'", tld);
        }

        let credentials = Credentials::from_parts(api_key, api_secret)?;
        Self::new(&tld, credentials, live, sim_fee_rate)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_price(&self, symbol: &str) -> VenueResult<Decimal> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self.http.get(&url).send().await.map_err(network_error)?;
        let ticker: TickerPrice = decode(resp).await?;

        if ticker.price <= Decimal::ZERO {
            return Err(VenueError::InvalidResponse(format!(
                "Non-positive price {} for {}",
                ticker.price, ticker.symbol
            )));
        }
        Ok(ticker.price)
    }

    async fn fetch_rules(&self, symbol: &str) -> VenueResult<Option<SymbolRules>> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let resp = self.http.get(&url).send().await.map_err(network_error)?;

        let info: ExchangeInfo = match decode(resp).await {
            Ok(info) => info,
            Err(VenueError::Rejected(msg)) if msg.starts_with(&INVALID_SYMBOL.to_string()) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        Ok(info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(rules_from_info))
    }

    /// Rules from the cache, fetched on first use.
    async fn cached_rules(&self, symbol: &str) -> VenueResult<SymbolRules> {
        if let Some(rules) = self.rules.read().await.get(symbol) {
            return Ok(rules.clone());
        }

        self.symbol_rules(symbol)
            .await?
            .ok_or_else(|| VenueError::Rejected(format!("Unknown symbol {}", symbol)))
    }

    /// Send a signed POST and return the raw response.
    async fn signed_post(&self, path: &str, params: &[(&str, String)]) -> VenueResult<Response> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| VenueError::NotConfigured("API credentials".to_string()))?;

        let query = signed_query(params, &creds.api_secret, Utc::now().timestamp_millis())?;
        let url = format!("{}{}?{}", self.base_url, path, query);

        self.http
            .post(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(network_error)
    }

    async fn place_live_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> VenueResult<OrderFill> {
        let rules = self.cached_rules(symbol).await?;
        let params = order_params(symbol, side, quantity);
        let resp = self.signed_post("/api/v3/order", &params).await?;
        let order: OrderResponse = decode(resp).await?;

        let fill = fill_from_response(&order, side, &rules);
        info!(
            symbol = %symbol,
            side = %side,
            order_id = order.order_id,
            status = %order.status,
            price = %fill.fill_price,
            filled = %fill.filled_quantity,
            fee = %fill.fee,
            "Order executed"
        );
        Ok(fill)
    }

    async fn place_simulated_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> VenueResult<OrderFill> {
        if self.credentials.is_some() {
            let params = order_params(symbol, side, quantity);
            let resp = self.signed_post("/api/v3/order/test", &params).await?;
            check_status(resp).await?;
            debug!(symbol = %symbol, side = %side, "Test order accepted");
        }

        let price = self.fetch_price(symbol).await?;
        Ok(simulated_fill(price, quantity, self.sim_fee_rate))
    }
}

#[async_trait]
impl Venue for BinanceClient {
    async fn get_price(&self, symbol: &str) -> VenueResult<Decimal> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(PRICE_RETRY_BUDGET))
            .build();

        backoff::future::retry(policy, || async {
            self.fetch_price(symbol).await.map_err(|e| {
                if e.is_transient() {
                    warn!(symbol = %symbol, error = %e, "Price fetch failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> VenueResult<OrderFill> {
        if quantity <= Decimal::ZERO {
            return Err(VenueError::Rejected(format!("Invalid quantity {}", quantity)));
        }

        if self.live {
            self.place_live_order(symbol, side, quantity).await
        } else {
            self.place_simulated_order(symbol, side, quantity).await
        }
    }

    async fn symbol_rules(&self, symbol: &str) -> VenueResult<Option<SymbolRules>> {
        let rules = self.fetch_rules(symbol).await?;
        if let Some(rules) = &rules {
            self.rules
                .write()
                .await
                .insert(symbol.to_string(), rules.clone());
        }
        Ok(rules)
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

fn network_error(e: reqwest::Error) -> VenueError {
    if e.is_decode() {
        VenueError::InvalidResponse(e.to_string())
    } else {
        VenueError::Network(e.to_string())
    }
}

/// Map a non-success HTTP status and body to a venue error.
fn status_error(status: StatusCode, body: &str) -> VenueError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return VenueError::RateLimited(format!("{} - {}", status, body));
    }
    if status.is_server_error() {
        return VenueError::Network(format!("{} - {}", status, body));
    }
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(err) => VenueError::Rejected(format!("{}: {}", err.code, err.msg)),
        Err(_) => VenueError::Rejected(format!("{} - {}", status, body)),
    }
}

async fn check_status(resp: Response) -> VenueResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> VenueResult<T> {
    let resp = check_status(resp).await?;
    let body = resp.text().await.map_err(network_error)?;
    serde_json::from_str(&body).map_err(|e| VenueError::InvalidResponse(e.to_string()))
}

/// Append `timestamp`, `recvWindow` and the hex HMAC-SHA256 signature.
fn signed_query(
    params: &[(&str, String)],
    secret: &str,
    timestamp_ms: i64,
) -> VenueResult<String> {
    let mut query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    if !query.is_empty() {
        query.push('&');
    }
    query.push_str(&format!("recvWindow={}&timestamp={}", RECV_WINDOW_MS, timestamp_ms));

    let signature = sign(secret, &query)?;
    Ok(format!("{}&signature={}", query, signature))
}

fn sign(secret: &str, payload: &str) -> VenueResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| VenueError::NotConfigured(format!("Invalid API secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn order_params(symbol: &str, side: TradeSide, quantity: Decimal) -> Vec<(&'static str, String)> {
    vec![
        ("symbol", symbol.to_string()),
        ("side", side.as_str().to_string()),
        ("type", "MARKET".to_string()),
        ("quantity", quantity.normalize().to_string()),
        ("newOrderRespType", "FULL".to_string()),
        ("newClientOrderId", format!("scp-{}", uuid::Uuid::new_v4().simple())),
    ]
}

fn rules_from_info(info: &SymbolInfo) -> SymbolRules {
    let mut filter = LotFilter {
        step_size: Decimal::ZERO,
        min_qty: Decimal::ZERO,
        min_notional: Decimal::ZERO,
    };

    for f in &info.filters {
        match f {
            SymbolFilter::LotSize { min_qty, step_size } => {
                filter.min_qty = *min_qty;
                filter.step_size = *step_size;
            }
            SymbolFilter::MinNotional { min_notional }
            | SymbolFilter::Notional { min_notional } => {
                filter.min_notional = filter.min_notional.max(*min_notional);
            }
            SymbolFilter::Other => {}
        }
    }

    SymbolRules {
        symbol: info.symbol.clone(),
        status: info.status.clone(),
        base_asset: info.base_asset.clone(),
        quote_asset: info.quote_asset.clone(),
        spot_allowed: info.is_spot_trading_allowed,
        filter,
    }
}

/// Quantity-weighted fill price and quote-denominated fee of a FULL response.
///
/// A commission charged in the base asset is converted at the fill price, and
/// on a buy it is taken off the received quantity. Commissions in any other
/// asset (BNB discounts) cannot be priced here and are left out of the fee.
fn fill_from_response(order: &OrderResponse, side: TradeSide, rules: &SymbolRules) -> OrderFill {
    let fill_qty: Decimal = order.fills.iter().map(|f| f.qty).sum();

    let mut base_fee = Decimal::ZERO;
    let mut quote_fee = Decimal::ZERO;
    for f in &order.fills {
        if f.commission_asset == rules.base_asset {
            base_fee += f.commission;
        } else if f.commission_asset == rules.quote_asset {
            quote_fee += f.commission;
        } else if !f.commission.is_zero() {
            warn!(
                order_id = order.order_id,
                commission = %f.commission,
                asset = %f.commission_asset,
                "Commission in a third asset, not included in fee"
            );
        }
    }

    let (quantity, price) = if fill_qty > Decimal::ZERO {
        let cost: Decimal = order.fills.iter().map(|f| f.price * f.qty).sum();
        (fill_qty, cost / fill_qty)
    } else if order.executed_qty > Decimal::ZERO {
        (order.executed_qty, order.cummulative_quote_qty / order.executed_qty)
    } else {
        (Decimal::ZERO, Decimal::ZERO)
    };

    let status = match order.status.as_str() {
        "FILLED" => FillStatus::Filled,
        _ if quantity > Decimal::ZERO => FillStatus::PartiallyFilled,
        _ => FillStatus::Unfilled,
    };

    let filled_quantity = match side {
        TradeSide::Buy => (quantity - base_fee).max(Decimal::ZERO),
        TradeSide::Sell => quantity,
    };

    OrderFill {
        status,
        fill_price: price,
        filled_quantity,
        fee: quote_fee + base_fee * price,
        order_id: Some(order.order_id.to_string()),
    }
}

fn simulated_fill(price: Decimal, quantity: Decimal, fee_rate: Decimal) -> OrderFill {
    OrderFill {
        status: FillStatus::Simulated,
        fill_price: price,
        filled_quantity: quantity,
        fee: price * quantity * fee_rate,
        order_id: None,
    }
}
