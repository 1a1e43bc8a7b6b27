mod lexer;
mod statement;

pub use self::lexer::{Lexer, Token};
pub use self::statement::{ParsedStatement, SelectInfo, TransactionStmt, TransactionType};
