use strum::Display;

use crate::riverpool::pg::sql::lexer::{Lexer, Token};

/// Isolation requested by BEGIN / START TRANSACTION
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum TransactionType {
    Default = 1,
    ReadOnly = 2,
    ReadUncommitted = 4,
    ReadCommitted = 5,
    RepeatableRead = 6,
    Serializable = 7,
}

impl TransactionType {
    pub fn parse_from_query(normalized_query: &str) -> Self {
        if normalized_query.contains("READ ONLY") {
            Self::ReadOnly
        } else if let Some(i) = normalized_query.find("COMMITTED") {
            if normalized_query[..i].ends_with("UN") {
                Self::ReadUncommitted
            } else {
                Self::ReadCommitted
            }
        } else if normalized_query.contains("REPEATABLE READ") {
            Self::RepeatableRead
        } else if normalized_query.contains("SERIALIZABLE") {
            Self::Serializable
        } else {
            Self::Default
        }
    }
}

#[derive(Display, Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransactionStmt {
    Begin(TransactionType), // includes START TRANSACTION
    Commit, // includes END
    Rollback, // includes ABORT
    Savepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
    PrepareTransaction,
    CommitPrepared,
    RollbackPrepared,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SelectInfo {
    pub into: bool,
    pub locking: bool,
    /// calls nextval() or setval()
    pub sequence: bool,
    /// a WITH whose body writes (INSERT/UPDATE/DELETE)
    pub writes: bool,
    pub relations: Vec<String>,
}

/// ParsedStatement is the classification of the first statement of a query string.
/// Callers only ask it questions, they never look at the structure of the SQL.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParsedStatement {
    Empty,
    Select(SelectInfo),
    Insert{relation: String},
    Update{relation: String},
    Delete{relation: String},
    Copy{relation: Option<String>, from_stdin: bool, to_stdout: bool},
    Explain{analyze: bool, inner: Box<ParsedStatement>},
    Transaction(TransactionStmt),
    Lock,
    Prepare{name: String, inner: Box<ParsedStatement>},
    Execute{name: String},
    /// name is None for DEALLOCATE ALL
    Deallocate{name: Option<String>},
    DropDatabase,
    Show{name: String},
    /// Anything else, by leading keyword. needs_transaction is decided when parsing.
    Other{keyword: String, needs_transaction: bool},
    /// The lexer could not make sense of the text
    Unparsable,
}

/// Statements that run inside an internal transaction when replicated
const TRANSACTIONAL_KEYWORDS: &[&str] = &[
    "ALTER", "GRANT", "REVOKE", "CLOSE", "CLUSTER", "CREATE", "DROP", "TRUNCATE", "COMMENT",
    "FETCH", "MOVE", "NOTIFY", "LISTEN", "UNLISTEN", "LOAD", "SET", "REINDEX", "DECLARE",
    "REASSIGN", "SECURITY",
];

impl ParsedStatement {
    pub fn parse(sql: &str) -> Self {
        match Lexer::new(sql).tokenize() {
            Ok(tokens) => Parser{tokens: &tokens, pos: 0}.statement(),
            Err(_) => ParsedStatement::Unparsable,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, ParsedStatement::Insert{..})
    }

    pub fn is_update_or_delete(&self) -> bool {
        matches!(self, ParsedStatement::Update{..} | ParsedStatement::Delete{..})
    }

    /// is_select returns true for statements that can be load balanced:
    /// SELECT/WITH without INTO or FOR UPDATE/SHARE, COPY TO STDOUT, EXPLAIN,
    /// and EXPLAIN ANALYZE of a SELECT. Unless ignore_leading_white_space is set,
    /// text starting with whitespace or a comment is not load balanced.
    pub fn is_select(&self, text: &str, ignore_leading_white_space: bool) -> bool {
        let text = if ignore_leading_white_space { text.trim_start() } else { text };
        match self {
            ParsedStatement::Select(info) => {
                if info.into || info.locking || info.writes {
                    return false;
                }
                matches!(text.as_bytes().first(), Some(b's' | b'S' | b'(' | b'w' | b'W' | b't' | b'T' | b'v' | b'V'))
            },
            ParsedStatement::Copy{to_stdout, ..} => *to_stdout,
            ParsedStatement::Explain{analyze, inner} => !*analyze || matches!(**inner, ParsedStatement::Select(_)),
            _ => false,
        }
    }

    /// is_sequence_mutation returns true for a SELECT calling nextval() or setval()
    pub fn is_sequence_mutation(&self) -> bool {
        matches!(self, ParsedStatement::Select(info) if info.sequence)
    }

    /// is_strict returns true if the caller must wait for completion on the reference node
    /// before sending the statement to the other nodes.
    pub fn is_strict(&self) -> bool {
        match self {
            ParsedStatement::Select(info) => info.into || info.locking,
            ParsedStatement::Insert{..} | ParsedStatement::Update{..} | ParsedStatement::Delete{..} | ParsedStatement::Lock => true,
            _ => false,
        }
    }

    /// needs_transaction returns true if the statement should be wrapped in an internal transaction
    pub fn needs_transaction(&self) -> bool {
        match self {
            ParsedStatement::Select(_) | ParsedStatement::Insert{..} | ParsedStatement::Update{..} |
            ParsedStatement::Delete{..} | ParsedStatement::Copy{..} | ParsedStatement::Lock |
            ParsedStatement::Prepare{..} | ParsedStatement::Execute{..} | ParsedStatement::Deallocate{..} => true,
            ParsedStatement::Other{needs_transaction, ..} => *needs_transaction,
            _ => false,
        }
    }

    pub fn is_drop_database(&self) -> bool {
        matches!(self, ParsedStatement::DropDatabase)
    }

    pub fn is_start_transaction(&self) -> bool {
        matches!(self, ParsedStatement::Transaction(TransactionStmt::Begin(_)))
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, ParsedStatement::Transaction(TransactionStmt::Commit))
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, ParsedStatement::Transaction(TransactionStmt::Rollback))
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(self, ParsedStatement::Transaction(_))
    }

    pub fn is_copy_from_stdin(&self) -> bool {
        matches!(self, ParsedStatement::Copy{from_stdin: true, ..})
    }

    /// show_name returns the variable of a SHOW statement
    pub fn show_name(&self) -> Option<&str> {
        match self {
            ParsedStatement::Show{name} => Some(name),
            _ => None,
        }
    }

    /// relations returns the tables this statement reads or writes, as far as they could be found
    pub fn relations(&self) -> Vec<&str> {
        match self {
            ParsedStatement::Select(info) => info.relations.iter().map(String::as_str).collect(),
            ParsedStatement::Insert{relation} | ParsedStatement::Update{relation} | ParsedStatement::Delete{relation} => vec![relation],
            ParsedStatement::Copy{relation: Some(relation), ..} => vec![relation],
            ParsedStatement::Explain{inner, ..} | ParsedStatement::Prepare{inner, ..} => inner.relations(),
            _ => Vec::new(),
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_word(&self) -> Option<&'a str> {
        match self.peek() {
            Some(Token::Word(w)) => Some(w),
            _ => None,
        }
    }

    fn accept(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(t) if t.is_word(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn rest(&self) -> &'a [Token] {
        &self.tokens[self.pos.min(self.tokens.len())..]
    }

    fn rest_contains(&self, kw: &str) -> bool {
        self.rest().iter().any(|t| t.is_word(kw))
    }

    /// normalized returns the remaining words joined by spaces
    fn normalized(&self) -> String {
        self.rest().iter().filter_map(Token::identifier).collect::<Vec<_>>().join(" ")
    }

    /// name_part returns an unquoted identifier folded to lower case, or a quoted identifier as is
    fn name_part(&mut self) -> Option<String> {
        match self.peek()? {
            Token::Word(w) => {
                self.pos += 1;
                Some(w.to_lowercase())
            },
            Token::QuotedIdentifier(w) => {
                self.pos += 1;
                Some(w.clone())
            },
            _ => None,
        }
    }

    /// qualified_name parses name or schema.name
    fn qualified_name(&mut self) -> Option<String> {
        let mut name = self.name_part()?;
        while matches!(self.peek(), Some(Token::Punct('.'))) {
            self.pos += 1;
            match self.name_part() {
                Some(part) => {
                    name.push('.');
                    name.push_str(&part);
                },
                None => break,
            }
        }
        Some(name)
    }

    fn statement(&mut self) -> ParsedStatement {
        // skip leading parens of a parenthesized select
        let first = match self.peek() {
            None => return ParsedStatement::Empty,
            Some(Token::Punct('(')) => return self.select(),
            Some(t) => t,
        };
        let kw = match first {
            Token::Word(w) => w.as_str(),
            _ => return ParsedStatement::Unparsable,
        };
        match kw {
            "SELECT" | "WITH" | "TABLE" | "VALUES" => self.select(),
            "INSERT" => {
                self.next();
                self.accept("INTO");
                ParsedStatement::Insert{relation: self.qualified_name().unwrap_or_default()}
            },
            "UPDATE" => {
                self.next();
                self.accept("ONLY");
                ParsedStatement::Update{relation: self.qualified_name().unwrap_or_default()}
            },
            "DELETE" => {
                self.next();
                self.accept("FROM");
                self.accept("ONLY");
                ParsedStatement::Delete{relation: self.qualified_name().unwrap_or_default()}
            },
            "COPY" => self.copy(),
            "EXPLAIN" => {
                self.next();
                let mut analyze = false;
                if matches!(self.peek(), Some(Token::Punct('('))) {
                    while let Some(tok) = self.next() {
                        if tok.is_word("ANALYZE") {
                            analyze = true;
                        } else if *tok == Token::Punct(')') {
                            break;
                        }
                    }
                } else {
                    loop {
                        if self.accept("ANALYZE") {
                            analyze = true;
                        } else if !self.accept("VERBOSE") {
                            break;
                        }
                    }
                }
                ParsedStatement::Explain{analyze, inner: Box::new(self.statement())}
            },
            "BEGIN" | "START" => {
                self.next();
                let normalized = self.normalized();
                ParsedStatement::Transaction(TransactionStmt::Begin(TransactionType::parse_from_query(&normalized)))
            },
            "COMMIT" | "END" => {
                self.next();
                if self.accept("PREPARED") {
                    ParsedStatement::Transaction(TransactionStmt::CommitPrepared)
                } else {
                    ParsedStatement::Transaction(TransactionStmt::Commit)
                }
            },
            "ROLLBACK" | "ABORT" => {
                self.next();
                if self.accept("PREPARED") {
                    ParsedStatement::Transaction(TransactionStmt::RollbackPrepared)
                } else if self.rest_contains("TO") {
                    ParsedStatement::Transaction(TransactionStmt::RollbackToSavepoint)
                } else {
                    ParsedStatement::Transaction(TransactionStmt::Rollback)
                }
            },
            "SAVEPOINT" => ParsedStatement::Transaction(TransactionStmt::Savepoint),
            "RELEASE" => ParsedStatement::Transaction(TransactionStmt::ReleaseSavepoint),
            "LOCK" => ParsedStatement::Lock,
            "PREPARE" => {
                self.next();
                if self.accept("TRANSACTION") {
                    return ParsedStatement::Transaction(TransactionStmt::PrepareTransaction);
                }
                let name = self.name_part().unwrap_or_default();
                if matches!(self.peek(), Some(Token::Punct('('))) {
                    while let Some(tok) = self.next() {
                        if *tok == Token::Punct(')') {
                            break;
                        }
                    }
                }
                self.accept("AS");
                ParsedStatement::Prepare{name, inner: Box::new(self.statement())}
            },
            "EXECUTE" => {
                self.next();
                let name = self.name_part().unwrap_or_default();
                ParsedStatement::Execute{name}
            },
            "DEALLOCATE" => {
                self.next();
                self.accept("PREPARE");
                if self.accept("ALL") {
                    ParsedStatement::Deallocate{name: None}
                } else {
                    ParsedStatement::Deallocate{name: self.name_part()}
                }
            },
            "DROP" => {
                self.next();
                if self.accept("DATABASE") {
                    ParsedStatement::DropDatabase
                } else {
                    let needs_transaction = !self.accept("TABLESPACE");
                    ParsedStatement::Other{keyword: "DROP".to_string(), needs_transaction}
                }
            },
            "SHOW" => {
                self.next();
                ParsedStatement::Show{name: self.normalized().to_lowercase()}
            },
            _ => self.other(kw),
        }
    }

    fn other(&mut self, kw: &str) -> ParsedStatement {
        self.next();
        let mut needs_transaction = TRANSACTIONAL_KEYWORDS.contains(&kw);
        match kw {
            "CREATE" => {
                // CREATE DATABASE, CREATE TABLESPACE and CREATE INDEX CONCURRENTLY can't run in a transaction block
                let next = self.peek_word().unwrap_or("");
                if next == "DATABASE" || next == "TABLESPACE" ||
                    ((next == "INDEX" || next == "UNIQUE") && self.rest_contains("CONCURRENTLY")) {
                    needs_transaction = false;
                }
            },
            "CLUSTER" => needs_transaction = self.peek().is_some(),
            "REINDEX" => {
                let next = self.peek_word().unwrap_or("");
                needs_transaction = next != "DATABASE" && next != "SYSTEM";
            },
            "ALTER" => needs_transaction = self.peek_word() != Some("TABLESPACE"),
            _ => (),
        }
        ParsedStatement::Other{keyword: kw.to_string(), needs_transaction}
    }

    fn copy(&mut self) -> ParsedStatement {
        self.next();
        let relation = if matches!(self.peek(), Some(Token::Punct('('))) {
            let mut depth = 0;
            while let Some(tok) = self.next() {
                match tok {
                    Token::Punct('(') => depth += 1,
                    Token::Punct(')') => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    },
                    _ => (),
                }
            }
            None
        } else {
            let name = self.qualified_name();
            if matches!(self.peek(), Some(Token::Punct('('))) {
                while let Some(tok) = self.next() {
                    if *tok == Token::Punct(')') {
                        break;
                    }
                }
            }
            name
        };
        let from = self.accept("FROM");
        let to = !from && self.accept("TO");
        ParsedStatement::Copy{
            relation,
            from_stdin: from && self.peek_word() == Some("STDIN"),
            to_stdout: to && self.peek_word() == Some("STDOUT"),
        }
    }

    fn select(&mut self) -> ParsedStatement {
        let mut info = SelectInfo::default();
        let mut depth = 0i32;
        let mut prev_was_for = false;
        while let Some(tok) = self.next() {
            match tok {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => depth -= 1,
                Token::Word(w) => {
                    match w.as_str() {
                        "INTO" if depth == 0 => info.into = true,
                        "INSERT" | "UPDATE" | "DELETE" if !prev_was_for => info.writes = true,
                        "NEXTVAL" | "SETVAL" if matches!(self.peek(), Some(Token::Punct('('))) => info.sequence = true,
                        "FROM" | "JOIN" => {
                            if matches!(self.peek(), Some(Token::Word(_)) | Some(Token::QuotedIdentifier(_))) {
                                self.relation_list(&mut info.relations);
                            }
                        },
                        _ => (),
                    }
                    if prev_was_for && depth == 0 && matches!(w.as_str(), "UPDATE" | "SHARE" | "NO" | "KEY") {
                        info.locking = true;
                    }
                    prev_was_for = w == "FOR";
                    continue;
                },
                _ => (),
            }
            prev_was_for = false;
        }
        ParsedStatement::Select(info)
    }

    /// relation_list reads `a, b.c alias, d` after FROM
    fn relation_list(&mut self, out: &mut Vec<String>) {
        loop {
            if self.accept("ONLY") || self.accept("LATERAL") {
                continue;
            }
            let name = match self.qualified_name() {
                Some(name) => name,
                None => return,
            };
            if matches!(self.peek(), Some(Token::Punct('('))) {
                return; // FROM generate_series(...) is a function, not a relation
            }
            out.push(name);
            // optional alias
            self.accept("AS");
            if let Some(w) = self.peek_word() {
                if !is_clause_keyword(w) {
                    self.pos += 1;
                }
            } else if matches!(self.peek(), Some(Token::QuotedIdentifier(_))) {
                self.pos += 1;
            }
            if matches!(self.peek(), Some(Token::Punct(','))) {
                self.pos += 1;
            } else {
                return;
            }
        }
    }
}

fn is_clause_keyword(w: &str) -> bool {
    matches!(w, "WHERE" | "GROUP" | "HAVING" | "ORDER" | "LIMIT" | "OFFSET" | "FOR" | "JOIN" | "INNER" |
        "LEFT" | "RIGHT" | "FULL" | "CROSS" | "NATURAL" | "ON" | "USING" | "UNION" | "EXCEPT" |
        "INTERSECT" | "WINDOW" | "FETCH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_classification() {
        let q = "SELECT a FROM public.users u JOIN orders o ON u.id = o.uid";
        let stmt = ParsedStatement::parse(q);
        assert!(stmt.is_select(q, false));
        assert!(!stmt.is_strict());
        assert_eq!(stmt.relations(), vec!["public.users", "orders"]);

        let q = "select * into t2 from t";
        let stmt = ParsedStatement::parse(q);
        assert!(!stmt.is_select(q, false));
        assert!(stmt.is_strict());

        let q = "SELECT * FROM t FOR UPDATE";
        assert!(!ParsedStatement::parse(q).is_select(q, false));
        assert!(ParsedStatement::parse(q).is_strict());

        let q = "SELECT nextval('s')";
        let stmt = ParsedStatement::parse(q);
        assert!(stmt.is_sequence_mutation());
        assert!(stmt.is_select(q, false));
    }

    #[test]
    fn test_leading_white_space() {
        let q = "  SELECT 1";
        let stmt = ParsedStatement::parse(q);
        assert!(!stmt.is_select(q, false));
        assert!(stmt.is_select(q, true));
        let q = "/* no load balance */ SELECT 1";
        assert!(!ParsedStatement::parse(q).is_select(q, true));
    }

    #[test]
    fn test_writes() {
        assert!(ParsedStatement::parse("UPDATE t SET x = 1").is_update_or_delete());
        assert!(ParsedStatement::parse("delete from only t").is_update_or_delete());
        assert!(ParsedStatement::parse("INSERT INTO t VALUES (1)").is_insert());
        assert_eq!(ParsedStatement::parse("INSERT INTO s.t VALUES (1)").relations(), vec!["s.t"]);
        assert!(ParsedStatement::parse("LOCK t").is_strict());
        let q = "WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x";
        assert!(!ParsedStatement::parse(q).is_select(q, false));
    }

    #[test]
    fn test_transaction_statements() {
        assert!(ParsedStatement::parse("BEGIN").is_start_transaction());
        assert_eq!(ParsedStatement::parse("START TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
            ParsedStatement::Transaction(TransactionStmt::Begin(TransactionType::Serializable)));
        assert!(ParsedStatement::parse("end").is_commit());
        assert!(ParsedStatement::parse("ABORT").is_rollback());
        assert_eq!(ParsedStatement::parse("ROLLBACK TO SAVEPOINT a"),
            ParsedStatement::Transaction(TransactionStmt::RollbackToSavepoint));
        assert!(!ParsedStatement::parse("COMMIT").needs_transaction());
    }

    #[test]
    fn test_needs_transaction() {
        assert!(ParsedStatement::parse("CREATE TABLE t (id int)").needs_transaction());
        assert!(!ParsedStatement::parse("CREATE DATABASE d").needs_transaction());
        assert!(!ParsedStatement::parse("CREATE INDEX CONCURRENTLY i ON t (x)").needs_transaction());
        assert!(!ParsedStatement::parse("VACUUM").needs_transaction());
        assert!(!ParsedStatement::parse("REINDEX DATABASE d").needs_transaction());
        assert!(ParsedStatement::parse("DROP DATABASE d").is_drop_database());
        assert!(ParsedStatement::parse("SET search_path = x").needs_transaction());
    }

    #[test]
    fn test_copy_explain_prepare() {
        let q = "COPY t TO STDOUT";
        assert!(ParsedStatement::parse(q).is_select(q, false));
        let q = "COPY t (a, b) FROM STDIN";
        let stmt = ParsedStatement::parse(q);
        assert!(stmt.is_copy_from_stdin());
        assert!(!stmt.is_select(q, false));

        let q = "EXPLAIN ANALYZE UPDATE t SET x = 1";
        assert!(!ParsedStatement::parse(q).is_select(q, false));
        let q = "EXPLAIN UPDATE t SET x = 1";
        assert!(ParsedStatement::parse(q).is_select(q, false));

        assert_eq!(ParsedStatement::parse("EXECUTE foo (1)"), ParsedStatement::Execute{name: "foo".to_string()});
        assert_eq!(ParsedStatement::parse("DEALLOCATE ALL"), ParsedStatement::Deallocate{name: None});
        match ParsedStatement::parse("PREPARE foo (int) AS SELECT $1") {
            ParsedStatement::Prepare{name, inner} => {
                assert_eq!(name, "foo");
                assert!(matches!(*inner, ParsedStatement::Select(_)));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ParsedStatement::parse("show pool_status").show_name(), Some("pool_status"));
        assert_eq!(ParsedStatement::parse("  "), ParsedStatement::Empty);
    }
}
