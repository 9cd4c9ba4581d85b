use std::error::Error;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{delete, get, post, put, web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use tripsplit::{
    ArchivedSettlement, Category, CurrencyRateTable, ExpenseDraft, FieldStore, Ledger,
    LedgerError, Member, MemoryFieldStore, MongoFieldStore, PendingWrite, Roster,
    ValidationError,
};

mod settings;

use settings::{Settings, Store};

fn error_response(err: &LedgerError) -> HttpResponse {
    match err {
        LedgerError::Validation(_) => HttpResponse::BadRequest().body(err.to_string()),
        LedgerError::NotSynced(_) => HttpResponse::ServiceUnavailable().body(err.to_string()),
        LedgerError::Store(_) | LedgerError::WriteAborted(_) => {
            HttpResponse::BadGateway().body(err.to_string())
        }
    }
}

fn validation_response(err: ValidationError) -> HttpResponse {
    error_response(&err.into())
}

/// Waits for the store to acknowledge a mutation.
async fn committed(write: Result<PendingWrite, LedgerError>, body: &str) -> HttpResponse {
    let write = match write {
        Ok(write) => write,
        Err(err) => return error_response(&err),
    };
    match write.await {
        Ok(()) => HttpResponse::Ok().body(body.to_string()),
        Err(err) => error_response(&err),
    }
}

#[get("/expenses")]
async fn get_expenses(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.expenses())
}

#[post("/expenses")]
async fn save_expense(ledger: web::Data<Ledger>, draft: web::Json<ExpenseDraft>) -> HttpResponse {
    committed(ledger.save_expense(draft.into_inner()), "Expense saved").await
}

#[delete("/expenses/{id}")]
async fn delete_expense(ledger: web::Data<Ledger>, id: web::Path<String>) -> HttpResponse {
    committed(ledger.delete_expense(&id), "Expense deleted").await
}

#[get("/expenses/{id}/shares")]
async fn get_expense_shares(ledger: web::Data<Ledger>, id: web::Path<String>) -> HttpResponse {
    match ledger.get_expense_shares(&id) {
        Ok(shares) => HttpResponse::Ok().json(shares),
        Err(err) => error_response(&err),
    }
}

#[get("/categories")]
async fn get_categories(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.get_spending_by_category())
}

#[get("/categories/{category}/expenses")]
async fn get_category_expenses(
    ledger: web::Data<Ledger>,
    category: web::Path<String>,
) -> HttpResponse {
    match category.parse::<Category>() {
        Ok(category) => HttpResponse::Ok().json(ledger.get_expenses_in_category(category)),
        Err(err) => validation_response(err),
    }
}

#[get("/balances")]
async fn get_balances(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.get_balances())
}

#[get("/settlements")]
async fn get_settlements(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.get_settlement_plans())
}

#[get("/settlements/pairwise")]
async fn get_pairwise_debts(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.get_pairwise_debts())
}

#[derive(Serialize)]
struct TotalJson {
    total: f64,
    currency: String,
}

#[get("/total")]
async fn get_total(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(TotalJson {
        total: ledger.get_total_in_common_currency(),
        currency: ledger.rates().common().to_string(),
    })
}

#[get("/settlements/archived")]
async fn get_archived_settlements(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.archived_settlements())
}

/// Either a full record (retry of an earlier archive) or a plan entry to
/// archive under a fresh id.
#[derive(Deserialize)]
#[serde(untagged)]
enum ArchiveJson {
    Record(ArchivedSettlement),
    Plan { from: String, to: String, amount: f64 },
}

#[post("/settlements/archived")]
async fn archive_settlement(ledger: web::Data<Ledger>, json: web::Json<ArchiveJson>) -> HttpResponse {
    let settlement = match json.into_inner() {
        ArchiveJson::Record(settlement) => settlement,
        ArchiveJson::Plan { from, to, amount } => {
            match ArchivedSettlement::new(from, to, amount, chrono::Utc::now()) {
                Ok(settlement) => settlement,
                Err(err) => return validation_response(err),
            }
        }
    };
    let write = match ledger.archive_settlement(settlement.clone()) {
        Ok(write) => write,
        Err(err) => return error_response(&err),
    };
    match write.await {
        Ok(()) => HttpResponse::Ok().json(settlement),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct ConfirmQuery {
    #[serde(default)]
    confirm: bool,
}

#[delete("/settlements/archived/{id}")]
async fn unarchive_settlement(
    ledger: web::Data<Ledger>,
    id: web::Path<String>,
    query: web::Query<ConfirmQuery>,
) -> HttpResponse {
    committed(
        ledger.unarchive_settlement(&id, query.confirm),
        "Settlement unarchived",
    )
    .await
}

#[get("/cleared-splits")]
async fn get_cleared_splits(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.cleared_splits())
}

#[put("/cleared-splits/{expense_id}/{member_id}")]
async fn toggle_cleared_split(
    ledger: web::Data<Ledger>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (expense_id, member_id) = path.into_inner();
    committed(
        ledger.toggle_cleared_split(&expense_id, &member_id),
        "Split toggled",
    )
    .await
}

#[get("/members")]
async fn get_members(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.roster())
}

#[post("/members")]
async fn add_member(ledger: web::Data<Ledger>, member: web::Json<Member>) -> HttpResponse {
    match ledger.add_member(member.into_inner()) {
        Ok(()) => HttpResponse::Ok().body("Member added"),
        Err(err) => validation_response(err),
    }
}

#[delete("/members/{id}")]
async fn remove_member(ledger: web::Data<Ledger>, id: web::Path<String>) -> HttpResponse {
    match ledger.remove_member(&id) {
        Ok(member) => HttpResponse::Ok().json(member),
        Err(err) => validation_response(err),
    }
}

#[get("/rates")]
async fn get_rates(ledger: web::Data<Ledger>) -> HttpResponse {
    HttpResponse::Ok().json(ledger.rates())
}

#[derive(Deserialize)]
struct RateJson {
    rate: f64,
}

#[put("/rates/{code}")]
async fn set_rate(
    ledger: web::Data<Ledger>,
    code: web::Path<String>,
    json: web::Json<RateJson>,
) -> HttpResponse {
    match ledger.set_rate(&code, json.rate) {
        Ok(()) => HttpResponse::Ok().body("Rate updated"),
        Err(err) => validation_response(err),
    }
}

#[delete("/rates/{code}")]
async fn remove_rate(ledger: web::Data<Ledger>, code: web::Path<String>) -> HttpResponse {
    match ledger.remove_rate(&code) {
        Ok(Some(_)) => HttpResponse::Ok().body("Rate removed"),
        Ok(None) => HttpResponse::NotFound().body("Couldn't find the desired rate"),
        Err(err) => validation_response(err),
    }
}

#[derive(Deserialize)]
struct ConvertQuery {
    amount: f64,
    currency: String,
    /// Convert from the common currency into `currency` instead.
    #[serde(default)]
    reverse: bool,
}

#[derive(Serialize)]
struct ConvertJson {
    amount: f64,
    currency: String,
}

#[get("/rates/convert")]
async fn convert(ledger: web::Data<Ledger>, query: web::Query<ConvertQuery>) -> HttpResponse {
    let rates = ledger.rates();
    let converted = if query.reverse {
        ConvertJson {
            amount: rates.convert_back(query.amount, &query.currency),
            currency: query.currency.to_ascii_uppercase(),
        }
    } else {
        ConvertJson {
            amount: rates.convert(query.amount, &query.currency),
            currency: rates.common().to_string(),
        }
    };
    HttpResponse::Ok().json(converted)
}

fn startup_error(err: impl Into<Box<dyn Error + Send + Sync>>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let settings = Settings::new().map_err(startup_error)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "tripsplit={level},actix_web={level}",
            level = settings.app.level
        ))
        .init();

    let store: Arc<dyn FieldStore> = match &settings.store {
        Store::Memory => {
            tracing::warn!("Using the in-memory store, data is lost on shutdown");
            Arc::new(MemoryFieldStore::new())
        }
        Store::Mongo {
            uri,
            database,
            collection,
        } => Arc::new(
            MongoFieldStore::connect(uri, database, collection, &settings.trip.id)
                .await
                .map_err(startup_error)?,
        ),
    };

    let roster = Roster::new(settings.trip.members).map_err(startup_error)?;
    let rates = CurrencyRateTable::with_rates(&settings.trip.common_currency, settings.trip.rates)
        .map_err(startup_error)?;
    let ledger = Ledger::new(store, roster, rates)
        .with_epsilon(settings.trip.epsilon)
        .map_err(startup_error)?;
    // Dropping these would stop the synchronization.
    let _subscriptions = ledger.sync_all().await.map_err(startup_error)?;

    let cors_origin = settings.server.cors_origin;
    tracing::info!(
        bind = %settings.server.bind,
        port = settings.server.port,
        trip = %settings.trip.id,
        "starting server"
    );

    HttpServer::new(move || {
        let cors = match &cors_origin {
            Some(origin) => Cors::default()
                .allowed_origin(origin)
                .allow_any_method()
                .allow_any_header(),
            None => Cors::permissive(),
        };
        App::new()
            .wrap(cors)
            .app_data(web::Data::new(ledger.clone()))
            .service(get_expenses)
            .service(save_expense)
            .service(delete_expense)
            .service(get_expense_shares)
            .service(get_categories)
            .service(get_category_expenses)
            .service(get_balances)
            .service(get_pairwise_debts)
            .service(get_archived_settlements)
            .service(archive_settlement)
            .service(unarchive_settlement)
            .service(get_settlements)
            .service(get_total)
            .service(get_cleared_splits)
            .service(toggle_cleared_split)
            .service(get_members)
            .service(add_member)
            .service(remove_member)
            .service(convert)
            .service(get_rates)
            .service(set_rate)
            .service(remove_rate)
    })
    .bind((settings.server.bind.as_str(), settings.server.port))?
    .run()
    .await
}
